//! Scope matching.
//!
//! A scope governs every URL whose serialization starts with the scope's
//! serialization. When several scopes match, the longest one wins.

use url::Url;

/// Whether `url` falls under `scope`.
///
/// Comparison is a case-sensitive prefix test on the serialized forms.
/// Neither side is expected to carry a fragment.
pub fn scope_matches(scope: &Url, url: &Url) -> bool {
    debug_assert!(scope.fragment().is_none());
    url.as_str().starts_with(scope.as_str())
}

/// Tracks the longest matching scope seen so far for a single document URL.
#[derive(Debug)]
pub struct LongestScopeMatcher<'a> {
    url: &'a Url,
    longest: Option<usize>,
}

impl<'a> LongestScopeMatcher<'a> {
    pub fn new(url: &'a Url) -> Self {
        Self { url, longest: None }
    }

    /// Returns true if `scope` matches and is longer than every previous match.
    pub fn match_longest(&mut self, scope: &Url) -> bool {
        if !scope_matches(scope, self.url) {
            return false;
        }
        let len = scope.as_str().len();
        match self.longest {
            Some(best) if best >= len => false,
            _ => {
                self.longest = Some(len);
                true
            }
        }
    }
}
