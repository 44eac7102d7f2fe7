//! Command line splitting helpers

/// Splits `args` into separate arguments.
///
/// Each string is split on `'` first, then on `"`, then on spaces: text
/// between a pair of quotes stays one argument (quotes removed), everything
/// else is split on single spaces with empty pieces dropped. Quotes do not
/// nest and an unbalanced quote extends to the end of its string.
pub fn parse_command_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for arg in args {
        for (i, single) in arg.as_ref().split('\'').enumerate() {
            if i % 2 == 1 {
                out.push(single.to_string());
                continue;
            }
            for (j, double) in single.split('"').enumerate() {
                if j % 2 == 1 {
                    out.push(double.to_string());
                    continue;
                }
                out.extend(
                    double
                        .split(' ')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }
    out
}

/// Parses `args` like [`parse_command_args`] and splits off the executable.
///
/// Returns `None` when nothing is left after parsing.
pub fn split_command<I, S>(args: I) -> Option<(String, Vec<String>)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = parse_command_args(args);
    if parsed.is_empty() {
        return None;
    }
    let exec = parsed.remove(0);
    Some((exec, parsed))
}
