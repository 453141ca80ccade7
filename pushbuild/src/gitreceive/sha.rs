use lazy_regex::regex_is_match;
use std::fmt;

/// Number of characters kept by [`GitSha::short`].
pub const SHORT_SHA_LEN: usize = 8;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not a valid git sha")]
pub struct InvalidShaError(pub String);

/// A full 40 character commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitSha(String);

impl GitSha {
    pub fn new(sha: &str) -> Result<Self, InvalidShaError> {
        if !regex_is_match!("^[0-9a-f]{40}$", sha) {
            return Err(InvalidShaError(sha.to_string()));
        }

        Ok(Self(sha.to_string()))
    }

    pub fn full(&self) -> &str {
        &self.0
    }

    /// The fixed length prefix used to namespace storage keys and job names.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_SHA_LEN]
    }
}

impl fmt::Display for GitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn short_is_a_fixed_prefix() {
        let sha = GitSha::new("1234567890abcdef1234567890abcdef12345678").unwrap();
        assert_eq!(sha.short(), "12345678");
        assert_eq!(sha.full(), "1234567890abcdef1234567890abcdef12345678");
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_short("12345678")]
    #[case::too_long("1234567890abcdef1234567890abcdef123456789")]
    #[case::uppercase("1234567890ABCDEF1234567890ABCDEF12345678")]
    #[case::not_hex("1234567890abcdef1234567890abcdef1234567g")]
    fn rejects_invalid_shas(#[case] sha: &str) {
        assert_eq!(GitSha::new(sha), Err(InvalidShaError(sha.to_string())));
    }
}
