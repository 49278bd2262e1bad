/// Identity equivalence as defined by the chat protocol. The registry and the
/// activity store only ever compare values through this.
pub trait IdentityNormalizer: Send + Sync {
    fn normalize(&self, value: &str) -> String;

    fn same(&self, a: &str, b: &str) -> bool {
        self.normalize(a) == self.normalize(b)
    }
}

/// Case mappings a server can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMapping {
    Ascii,
    Rfc1459,
    StrictRfc1459,
}

impl CaseMapping {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ascii" => Some(CaseMapping::Ascii),
            "rfc1459" => Some(CaseMapping::Rfc1459),
            "strict-rfc1459" => Some(CaseMapping::StrictRfc1459),
            _ => None,
        }
    }

    fn fold(self, c: char) -> char {
        match (self, c) {
            (_, 'A'..='Z') => c.to_ascii_lowercase(),
            (CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459, '[') => '{',
            (CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459, ']') => '}',
            (CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459, '\\') => '|',
            (CaseMapping::Rfc1459, '~') => '^',
            _ => c,
        }
    }
}

impl IdentityNormalizer for CaseMapping {
    fn normalize(&self, value: &str) -> String {
        value.chars().map(|c| self.fold(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_only_folds_letters() {
        assert_eq!(CaseMapping::Ascii.normalize("Nick[Away]"), "nick[away]");
    }

    #[test]
    fn rfc1459_folds_brackets_and_tilde() {
        let m = CaseMapping::Rfc1459;
        assert_eq!(m.normalize("Foo[\\]~"), "foo{|}^");
        assert!(m.same("ALICE", "alice"));
        assert!(m.same("a[b]", "A{B}"));
    }

    #[test]
    fn strict_rfc1459_keeps_tilde() {
        assert_eq!(CaseMapping::StrictRfc1459.normalize("X~[ ]"), "x~{ }");
    }

    #[test]
    fn non_ascii_is_left_alone() {
        assert_eq!(CaseMapping::Rfc1459.normalize("Ünïcode"), "Ünïcode");
    }

    #[test]
    fn names_parse() {
        assert_eq!(CaseMapping::from_name("rfc1459"), Some(CaseMapping::Rfc1459));
        assert_eq!(
            CaseMapping::from_name("strict-rfc1459"),
            Some(CaseMapping::StrictRfc1459)
        );
        assert_eq!(CaseMapping::from_name("unicode"), None);
    }
}
