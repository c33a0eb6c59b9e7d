use wildmatch::WildMatch;

/// Decides which CONNECT targets get their TLS terminated by the proxy.
#[derive(Debug, Clone, Default)]
pub struct ScopeMatcher {
    allow_list: Vec<WildMatch>,
    block_list: Vec<WildMatch>,
}

impl ScopeMatcher {
    /// `intercept` patterns select hosts (empty means every host);
    /// `passthrough` patterns are always tunnelled untouched.
    pub fn new(intercept: &[String], passthrough: &[String]) -> Self {
        Self {
            allow_list: intercept.iter().map(|p| pattern(p)).collect(),
            block_list: passthrough.iter().map(|p| pattern(p)).collect(),
        }
    }

    /// Block list wins; an empty allow list allows everything else.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.block_list.iter().any(|p| p.matches(&host)) {
            return false;
        }
        self.allow_list.is_empty() || self.allow_list.iter().any(|p| p.matches(&host))
    }
}

fn pattern(raw: &str) -> WildMatch {
    WildMatch::new(&raw.to_ascii_lowercase())
}
