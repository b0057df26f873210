//! Shell quoting used for logging external commands and parsing `-c` strings.

/// Characters that force a word to be quoted.
const SPECIAL: &[char] = &[
    ' ', '\t', '\n', '\r', '"', '\'', '\\', '$', '`', '!', '*', '?', '[', ']', '{', '}', '(',
    ')', '<', '>', '|', '&', ';', '#', '~',
];

/// Quote a word so it can be pasted back into a POSIX shell.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if !s.contains(SPECIAL) {
        return s.to_string();
    }
    // abc's -> 'abc'"'"'s'
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Join arguments into a single copy-pasteable command line.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|s| quote(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a command string into argv the way a shell would.
pub fn split_args(s: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("--memory=512m"), "--memory=512m");
        assert_eq!(quote("sh -c"), "'sh -c'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_join_args() {
        let args = ["docker", "exec", "sbx-1", "sh", "-c", "echo $HOME"];
        assert_eq!(join_args(args), "docker exec sbx-1 sh -c 'echo $HOME'");
    }

    #[test]
    fn test_split_args() {
        let args = split_args("python3 -c 'print(1 + 1)'").unwrap();
        assert_eq!(args, vec!["python3", "-c", "print(1 + 1)"]);
        assert!(split_args("echo 'unterminated").is_err());
    }
}
