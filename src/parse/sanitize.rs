/// Clean up a host name, service description, command or label.
///
/// Drops control characters, trims surrounding whitespace and unwraps
/// labels quoted in single quotes, until nothing changes. Whitespace
/// escaped with a backslash is kept, and so is any other escaped content.
/// Applying it twice gives the same result as applying it once.
pub fn sanitize(input: &str) -> String {
    let mut current: String = input.chars().filter(|c| !c.is_control()).collect();
    loop {
        let trimmed = trim_unescaped(&current);
        let unquoted = trimmed
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .unwrap_or(trimmed);
        if unquoted.len() == current.len() {
            return current;
        }
        current = unquoted.to_string();
    }
}

fn trim_unescaped(s: &str) -> &str {
    let start = s.trim_start();
    let trimmed = start.trim_end();
    if trimmed.len() == start.len() || !ends_with_escape(trimmed) {
        return trimmed;
    }
    // Keep the escaped whitespace character.
    let kept = start[trimmed.len()..]
        .chars()
        .next()
        .map(char::len_utf8)
        .unwrap_or(0);
    &start[..trimmed.len() + kept]
}

/// True when `s` ends in an odd run of backslashes.
fn ends_with_escape(s: &str) -> bool {
    s.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}
