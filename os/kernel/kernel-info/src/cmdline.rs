//! # Kernel Command Line
//!
//! Whitespace separated words, each either a bare flag (`quiet`) or a
//! `key=value` pair (`loglevel=debug`). Later occurrences of a key win.

/// Borrowed view of the kernel command line.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CommandLine<'a>(&'a str);

/// One word of the command line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Arg<'a> {
    Flag(&'a str),
    Pair(&'a str, &'a str),
}

impl<'a> CommandLine<'a> {
    #[must_use]
    pub const fn new(line: &'a str) -> Self {
        Self(line)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn args(&self) -> impl Iterator<Item = Arg<'a>> + Clone + 'a {
        self.0.split_ascii_whitespace().map(|word| match word.split_once('=') {
            Some((key, value)) => Arg::Pair(key, value),
            None => Arg::Flag(word),
        })
    }

    /// Value of the last `key=value` word with the given key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.args()
            .filter_map(|arg| match arg {
                Arg::Pair(k, v) if k == key => Some(v),
                _ => None,
            })
            .last()
    }

    /// `true` if `name` appears as a bare flag.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.args().any(|arg| arg == Arg::Flag(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_and_flags() {
        let cmd = CommandLine::new("  loglevel=debug  quiet root=/dev/sda1 ");
        assert_eq!(cmd.get("loglevel"), Some("debug"));
        assert_eq!(cmd.get("root"), Some("/dev/sda1"));
        assert!(cmd.flag("quiet"));
        assert!(!cmd.flag("loglevel"));
        assert_eq!(cmd.get("missing"), None);
    }

    #[test]
    fn last_value_wins() {
        let cmd = CommandLine::new("loglevel=info loglevel=trace");
        assert_eq!(cmd.get("loglevel"), Some("trace"));
    }

    #[test]
    fn empty_value_is_kept() {
        let cmd = CommandLine::new("console=");
        assert_eq!(cmd.get("console"), Some(""));
    }
}
