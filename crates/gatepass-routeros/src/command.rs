//! Command sentence builder.

/// One API command: a path plus attribute and query words.
///
/// ```
/// use gatepass_routeros::Command;
///
/// let cmd = Command::new("/ip/hotspot/user/add")
///     .attr("name", "K7Q2P9")
///     .attr("profile", "1_Day");
/// assert_eq!(cmd.path(), "/ip/hotspot/user/add");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            words: vec![path.into()],
        }
    }

    /// Add an `=key=value` attribute word.
    pub fn attr(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.words.push(format!("={key}={}", value.as_ref()));
        self
    }

    /// Add the attribute only when a value is present. RouterOS treats
    /// an empty attribute and an absent one differently, so optional
    /// fields must be omitted, not blanked.
    pub fn attr_opt(mut self, key: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.words.push(format!("={key}={value}"));
        }
        self
    }

    /// Add a `?key=value` query word (print filters).
    pub fn query(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.words.push(format!("?{key}={}", value.as_ref()));
        self
    }

    /// The command path (first word).
    pub fn path(&self) -> &str {
        self.words.first().map_or("", String::as_str)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_words_in_order() {
        let cmd = Command::new("/ip/hotspot/active/login")
            .attr("user", "K7Q2P9")
            .attr("password", "4821")
            .query("dummy", "1");
        assert_eq!(
            cmd.words(),
            &[
                "/ip/hotspot/active/login",
                "=user=K7Q2P9",
                "=password=4821",
                "?dummy=1",
            ]
        );
    }

    #[test]
    fn optional_attributes_are_omitted_entirely() {
        let cmd = Command::new("/ip/hotspot/user/add")
            .attr("name", "483920")
            .attr_opt("password", None);
        assert_eq!(cmd.words().len(), 2);

        let cmd = Command::new("/ip/hotspot/user/add")
            .attr("name", "K7Q2P9")
            .attr_opt("password", Some("4821"));
        assert_eq!(cmd.words().len(), 3);
    }
}
