//! App resolution (`spec.md` §4.6): a mapping from pattern to external
//! command, with `{name}`-style parameter capture.
//!
//! No teacher file owns anything like this — the teacher's sessions never
//! dispatch to an external process. `regex` compiles captures (corpus
//! precedent: pattern-based routing in the wider retrieval pack) and
//! `shlex` quotes captured parameters before they're appended to the
//! spawned command line (corpus precedent: `wez-wezterm`).

use regex::Regex;

use crate::Result;

struct Entry {
    pattern: String,
    command: String,
    capture: Option<(Regex, Vec<String>)>,
}

/// The registered set of (pattern → command) mappings, preserving
/// registration order for the "first match wins" resolution rule.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

/// A resolved app: which pattern matched, the command to run, and the
/// ordered parameter captures (if the pattern had any `{name}` spans).
#[derive(Debug, Clone)]
pub struct Resolution {
    pub app: String,
    pub command: String,
    pub params: Vec<(String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern (e.g. `"chat-{room}"`, `"guestbook"`, `"default"`)
    /// mapped to the command that should be spawned when it resolves.
    pub fn register(&mut self, pattern: impl Into<String>, command: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        let capture = compile(&pattern)?;

        self.entries.push(Entry {
            pattern,
            command: command.into(),
            capture,
        });

        Ok(())
    }

    /// Resolve `name` against the registry: exact match first, then the
    /// first pattern (in registration order) whose regex matches, then
    /// `"default"` if registered, else `None`.
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        if let Some(entry) = self.entries.iter().find(|e| e.pattern == name) {
            return Some(Resolution {
                app: entry.pattern.clone(),
                command: entry.command.clone(),
                params: Vec::new(),
            });
        }

        for entry in &self.entries {
            let Some((regex, names)) = &entry.capture else {
                continue;
            };

            if let Some(captures) = regex.captures(name) {
                let params = names
                    .iter()
                    .map(|n| (n.clone(), captures.name(n).map(|m| m.as_str().to_owned()).unwrap_or_default()))
                    .collect();

                return Some(Resolution {
                    app: entry.pattern.clone(),
                    command: entry.command.clone(),
                    params,
                });
            }
        }

        self.entries
            .iter()
            .find(|e| e.pattern == "default")
            .map(|entry| Resolution {
                app: entry.pattern.clone(),
                command: entry.command.clone(),
                params: Vec::new(),
            })
    }

    /// Build the full, shell-quoted command line for a resolution: the
    /// command followed by each captured parameter, in capture order.
    pub fn command_line(resolution: &Resolution) -> String {
        let mut parts = vec![resolution.command.clone()];

        parts.extend(
            resolution
                .params
                .iter()
                .map(|(_, value)| shlex::try_quote(value).unwrap_or_default().into_owned()),
        );

        parts.join(" ")
    }
}

/// Compile a `{name}`-bearing pattern into a regex with one named capture
/// group per placeholder, escaping the literal spans in between. Patterns
/// with no placeholders compile to `None` — they're resolved by exact
/// match only.
fn compile(pattern: &str) -> Result<Option<(Regex, Vec<String>)>> {
    if !pattern.contains('{') {
        return Ok(None);
    }

    let mut regex_src = String::from("^");
    let mut names = Vec::new();
    let mut rest = pattern;

    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            regex_src.push_str(&regex::escape(rest));
            rest = "";
            break;
        };

        regex_src.push_str(&regex::escape(&rest[..start]));

        let name = &rest[start + 1..start + end];
        regex_src.push_str(&format!("(?P<{name}>[^/]+)"));
        names.push(name.to_owned());

        rest = &rest[start + end + 1..];
    }

    regex_src.push_str(&regex::escape(rest));
    regex_src.push('$');

    Ok(Some((Regex::new(&regex_src)?, names)))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("chat-lobby", "room", "lobby")]
    #[case("chat-general", "room", "general")]
    #[case("chat-", "room", "")]
    fn parameterized_pattern_captures_across_inputs(
        #[case] username: &str,
        #[case] param_name: &str,
        #[case] param_value: &str,
    ) {
        let mut registry = Registry::new();
        registry.register("chat-{room}", "/bin/chat.sh").unwrap();

        let resolution = registry.resolve(username);

        if param_value.is_empty() && username.ends_with('-') {
            // "chat-" has no characters left for `[^/]+` to capture.
            assert!(resolution.is_none());
            return;
        }

        let resolution = resolution.unwrap();
        assert_eq!(resolution.params, vec![(param_name.to_owned(), param_value.to_owned())]);
    }

    #[test]
    fn exact_match_wins_over_patterns() {
        let mut registry = Registry::new();
        registry.register("guestbook", "/bin/guestbook").unwrap();

        let resolution = registry.resolve("guestbook").unwrap();
        assert_eq!(resolution.command, "/bin/guestbook");
        assert!(resolution.params.is_empty());
    }

    #[test]
    fn parameterized_pattern_captures_in_order() {
        let mut registry = Registry::new();
        registry.register("chat-{room}", "/bin/chat.sh").unwrap();

        let resolution = registry.resolve("chat-lobby").unwrap();
        assert_eq!(resolution.app, "chat-{room}");
        assert_eq!(resolution.params, vec![("room".to_owned(), "lobby".to_owned())]);
        assert_eq!(Registry::command_line(&resolution), "/bin/chat.sh lobby");
    }

    #[test]
    fn falls_back_to_default_then_fails() {
        let mut registry = Registry::new();
        registry.register("default", "/bin/default-app").unwrap();

        assert_eq!(registry.resolve("anything").unwrap().command, "/bin/default-app");

        let empty = Registry::new();
        assert!(empty.resolve("anything").is_none());
    }

    #[test]
    fn first_registered_pattern_wins_on_ambiguous_matches() {
        let mut registry = Registry::new();
        registry.register("{name}", "/bin/catch-all").unwrap();
        registry.register("chat-{room}", "/bin/chat.sh").unwrap();

        // "{name}" was registered first and matches everything, so it wins.
        let resolution = registry.resolve("chat-lobby").unwrap();
        assert_eq!(resolution.command, "/bin/catch-all");
    }
}
