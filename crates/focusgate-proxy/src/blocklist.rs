//! Blocked site matching.
//!
//! A [`Blocklist`] is built once per session and never mutated afterwards.
//! A restart builds a new one and the engine serving it is replaced along
//! with it.

/// Normalizes a configured site: trims whitespace and lowercases.
pub fn normalize(site: &str) -> String {
    site.trim().to_lowercase()
}

/// Immutable set of blocked hostname fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocklist {
    entries: Vec<String>,
}

impl Blocklist {
    /// Builds a blocklist from configured sites.
    ///
    /// Entries that are empty after normalization are dropped, since an empty
    /// fragment would match every hostname. Duplicates are kept once.
    pub fn build<I, S>(sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries: Vec<String> = Vec::new();
        for site in sites {
            let site = normalize(site.as_ref());
            if !site.is_empty() && !entries.contains(&site) {
                entries.push(site);
            }
        }
        Self { entries }
    }

    /// Returns true if any entry occurs in the hostname.
    ///
    /// Matching is a case-insensitive substring test, so `example.com` also
    /// blocks `www.example.com` and `cdn.example.com`, and over-blocks
    /// `notexample.com`.
    ///
    /// # Examples
    ///
    /// ```
    /// use focusgate_proxy::Blocklist;
    ///
    /// let blocklist = Blocklist::build(["Example.com "]);
    /// assert!(blocklist.matches("sub.EXAMPLE.com"));
    /// assert!(!blocklist.matches("other.org"));
    /// ```
    pub fn matches(&self, hostname: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let hostname = hostname.to_lowercase();
        self.entries
            .iter()
            .any(|entry| hostname.contains(entry.as_str()))
    }

    /// Returns the normalized entries.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is blocked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
