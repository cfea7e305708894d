//! Turn `-c key=value` options into a configuration source.

use config::{ConfigError, Source, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// The toml lines given on the command line, as one toml document.
///
/// With arguments of the form "key=bareword", the bareword is quoted
/// for convenience; `config` is happy to turn strings into numbers and
/// booleans later.
#[derive(Debug, Clone, Default)]
pub(crate) struct CmdLine {
    /// List of toml lines as given on the command line.
    contents: Vec<String>,
}

impl CmdLine {
    /// Make a new empty command-line.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a single line of toml to the configuration.
    pub(crate) fn push_toml_line(&mut self, line: String) {
        self.contents.push(line);
    }

    /// Compose the lines into a single toml string.
    pub(crate) fn build_toml(&self) -> String {
        let mut toml_s = String::new();
        for line in &self.contents {
            toml_s.push_str(tweak_toml_bareword(line).as_ref().unwrap_or(line));
            toml_s.push('\n');
        }
        toml_s
    }

    /// Rewrite a toml error message `msg` so that it names the `-c`
    /// argument on line `pos` instead of a line and column.
    fn locate_error(&self, msg: &str, pos: Option<(usize, usize)>) -> String {
        /// Matches the location suffix that the toml crate adds.
        static LINE_COL: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(.*?) at line [0-9]+ column [0-9]+$").expect("Bad location regex")
        });
        let msg = LINE_COL
            .captures(msg)
            .and_then(|c| c.get(1))
            .map_or(msg, |m| m.as_str());

        match pos.and_then(|(line, _)| self.contents.get(line)) {
            Some(arg) => format!("{} in {:?}", msg, arg),
            None => format!("{} on command line", msg),
        }
    }
}

impl Source for CmdLine {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>, ConfigError> {
        let value: toml::Value = toml::from_str(&self.build_toml())
            .map_err(|e| ConfigError::Message(self.locate_error(&e.to_string(), e.line_col())))?;
        value
            .try_into()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))
    }
}

/// If `s` looks like "dotted.key = bareword", return it with the bareword
/// quoted.  Otherwise return None.
fn tweak_toml_bareword(s: &str) -> Option<String> {
    /// A dotted key, `=`, and one bareword without hyphens.
    static KEY_BAREWORD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?x)
              ^ [\ \t]*
              ( (?:[A-Za-z0-9_-]+\.)* [A-Za-z0-9_-]+ )
              [\ \t]* = [\ \t]*
              ( [A-Za-z0-9_]+ )
              [\ \t]* $",
        )
        .expect("Bad bareword regex")
    });

    KEY_BAREWORD
        .captures(s)
        .map(|c| format!("{}=\"{}\"", &c[1], &c[2]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bareword_expansion() {
        assert_eq!(tweak_toml_bareword("dsfklj"), None);
        assert_eq!(tweak_toml_bareword("=42"), None);
        assert_eq!(tweak_toml_bareword("x=\"quoted\""), None);
        assert_eq!(tweak_toml_bareword("x=[1,2]"), None);
        assert_eq!(tweak_toml_bareword("x= 1.5"), None);
        assert_eq!(tweak_toml_bareword("log_level=tor61-relay"), None);
        assert_eq!(
            tweak_toml_bareword("log_level=debug"),
            Some("log_level=\"debug\"".into())
        );
        assert_eq!(
            tweak_toml_bareword(" circuit.length = 4 "),
            Some("circuit.length=\"4\"".into())
        );
        assert_eq!(
            tweak_toml_bareword("a.b-c.d=true"),
            Some("a.b-c.d=\"true\"".into())
        );
    }

    #[test]
    fn build() {
        let mut cl = CmdLine::new();
        cl.push_toml_line("proxy_port=9000".to_string());
        cl.push_toml_line("directory.server = \"localhost:46101\"".to_string());
        assert_eq!(
            cl.build_toml(),
            "proxy_port=\"9000\"\ndirectory.server = \"localhost:46101\"\n"
        );
    }

    #[test]
    fn error_locations() {
        let mut cl = CmdLine::new();
        cl.push_toml_line("group=7".to_string());
        cl.push_toml_line("instance=[".to_string());

        assert_eq!(
            cl.locate_error("expected a value at line 2 column 11", Some((1, 10))),
            "expected a value in \"instance=[\""
        );
        assert_eq!(
            cl.locate_error("expected a value at line 9 column 1", Some((8, 0))),
            "expected a value on command line"
        );
        assert_eq!(
            cl.locate_error("no location here", None),
            "no location here on command line"
        );
    }

    #[test]
    fn collect() {
        let mut cl = CmdLine::new();
        cl.push_toml_line("proxy_port=9000".to_string());
        cl.push_toml_line("circuit.length=2".to_string());
        cl.push_toml_line("directory.server=\"localhost:46101\"".to_string());
        let map = cl.collect().unwrap();
        assert_eq!(map["proxy_port"], "9000".into());
        assert!(map.contains_key("circuit"));
        assert!(map.contains_key("directory"));
    }

    #[test]
    fn bad_argument_is_named() {
        let mut cl = CmdLine::new();
        cl.push_toml_line("proxy_port=9000".to_string());
        cl.push_toml_line("circuit.length = 2 3".to_string());
        cl.push_toml_line("group=3".to_string());
        let msg = cl.collect().unwrap_err().to_string();
        assert!(msg.ends_with("in \"circuit.length = 2 3\""), "{}", msg);
        assert!(!msg.contains("at line"), "{}", msg);
    }
}
