use std::path::{Path, PathBuf};
use std::sync::Arc;

use voicebot_contracts::IdentityKind;
use voicebot_kernel::{AddOutcome, IdentityNormalizer, RemoveOutcome};

use crate::store::{write_text_atomic, StorageError};

const COMMENT_PREFIX: char = '#';

/// One managed list file. Entries keep the spelling they were added with.
struct ManagedList {
    path: PathBuf,
    entries: Vec<String>,
}

impl ManagedList {
    fn load(path: &Path, normalizer: &dyn IdentityNormalizer) -> Result<Self, StorageError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let mut entries: Vec<String> = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with(COMMENT_PREFIX) {
                continue;
            }
            if entry.contains(char::is_whitespace) {
                return Err(StorageError::malformed(
                    path,
                    format!("line {} holds more than one entry", idx + 1),
                ));
            }
            if !entries.iter().any(|e| normalizer.same(e, entry)) {
                entries.push(entry.to_string());
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    fn position(&self, value: &str, normalizer: &dyn IdentityNormalizer) -> Option<usize> {
        let wanted = normalizer.normalize(value);
        self.entries
            .iter()
            .position(|e| normalizer.normalize(e) == wanted)
    }

    fn save(&self) -> Result<(), StorageError> {
        if self.entries.is_empty() && !self.path.exists() {
            return Ok(());
        }
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(entry);
            text.push('\n');
        }
        write_text_atomic(&self.path, &text)
    }
}

/// The nickname and account sets under management.
pub struct Registry {
    nicknames: ManagedList,
    accounts: ManagedList,
    normalizer: Arc<dyn IdentityNormalizer>,
}

impl Registry {
    pub fn open(
        nicknames_path: &Path,
        accounts_path: &Path,
        normalizer: Arc<dyn IdentityNormalizer>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            nicknames: ManagedList::load(nicknames_path, normalizer.as_ref())?,
            accounts: ManagedList::load(accounts_path, normalizer.as_ref())?,
            normalizer,
        })
    }

    pub fn add(&mut self, kind: IdentityKind, value: &str) -> Result<AddOutcome, StorageError> {
        if self.contains(kind, value) {
            return Ok(AddOutcome::AlreadyPresent);
        }
        let list = self.list_mut(kind);
        list.entries.push(value.to_string());
        list.save()?;
        Ok(AddOutcome::Added)
    }

    pub fn remove(&mut self, kind: IdentityKind, value: &str) -> Result<RemoveOutcome, StorageError> {
        let normalizer = Arc::clone(&self.normalizer);
        let list = self.list_mut(kind);
        match list.position(value, normalizer.as_ref()) {
            Some(idx) => {
                list.entries.remove(idx);
                list.save()?;
                Ok(RemoveOutcome::Removed)
            }
            None => Ok(RemoveOutcome::WasAbsent),
        }
    }

    pub fn contains(&self, kind: IdentityKind, value: &str) -> bool {
        self.list_ref(kind)
            .position(value, self.normalizer.as_ref())
            .is_some()
    }

    pub fn list(&self, kind: IdentityKind) -> &[String] {
        &self.list_ref(kind).entries
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.nicknames.save()?;
        self.accounts.save()
    }

    fn list_ref(&self, kind: IdentityKind) -> &ManagedList {
        match kind {
            IdentityKind::Nickname => &self.nicknames,
            IdentityKind::Account => &self.accounts,
        }
    }

    fn list_mut(&mut self, kind: IdentityKind) -> &mut ManagedList {
        match kind {
            IdentityKind::Nickname => &mut self.nicknames,
            IdentityKind::Account => &mut self.accounts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_path;
    use voicebot_kernel::CaseMapping;

    fn open(nicks: &Path, accounts: &Path) -> Registry {
        Registry::open(nicks, accounts, Arc::new(CaseMapping::Rfc1459)).unwrap()
    }

    #[test]
    fn add_twice_is_idempotent() {
        let nicks = temp_path("nicknames-idem");
        let accounts = temp_path("accounts-idem");
        let mut registry = open(&nicks, &accounts);

        assert_eq!(
            registry.add(IdentityKind::Nickname, "alice").unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            registry.add(IdentityKind::Nickname, "ALICE").unwrap(),
            AddOutcome::AlreadyPresent
        );
        assert_eq!(registry.list(IdentityKind::Nickname), ["alice"]);
        assert!(registry.contains(IdentityKind::Nickname, "Alice"));
        assert!(!registry.contains(IdentityKind::Account, "alice"));
    }

    #[test]
    fn removing_absent_entry_reports_was_absent() {
        let mut registry = open(&temp_path("nicknames-rm"), &temp_path("accounts-rm"));
        assert_eq!(
            registry.remove(IdentityKind::Account, "acct1").unwrap(),
            RemoveOutcome::WasAbsent
        );
        registry.add(IdentityKind::Account, "acct1").unwrap();
        assert_eq!(
            registry.remove(IdentityKind::Account, "ACCT1").unwrap(),
            RemoveOutcome::Removed
        );
        assert!(registry.list(IdentityKind::Account).is_empty());
    }

    #[test]
    fn list_files_round_trip_bit_for_bit() {
        let nicks = temp_path("nicknames-rt");
        let accounts = temp_path("accounts-rt");
        {
            let mut registry = open(&nicks, &accounts);
            registry.add(IdentityKind::Nickname, "Zed").unwrap();
            registry.add(IdentityKind::Nickname, "alice[away]").unwrap();
            registry.add(IdentityKind::Account, "acct1").unwrap();
        }
        let before_nicks = std::fs::read(&nicks).unwrap();
        let before_accounts = std::fs::read(&accounts).unwrap();
        assert_eq!(before_nicks, b"Zed\nalice[away]\n");

        let reloaded = open(&nicks, &accounts);
        assert_eq!(reloaded.list(IdentityKind::Nickname), ["Zed", "alice[away]"]);
        reloaded.flush().unwrap();
        assert_eq!(std::fs::read(&nicks).unwrap(), before_nicks);
        assert_eq!(std::fs::read(&accounts).unwrap(), before_accounts);
    }

    #[test]
    fn load_skips_comments_blanks_and_case_duplicates() {
        let nicks = temp_path("nicknames-load");
        std::fs::write(&nicks, "# managed nicks\n\n  alice \nAlice\nbob\n").unwrap();
        let registry = open(&nicks, &temp_path("accounts-load"));
        assert_eq!(registry.list(IdentityKind::Nickname), ["alice", "bob"]);
    }

    #[test]
    fn load_rejects_lines_with_several_entries() {
        let nicks = temp_path("nicknames-bad");
        std::fs::write(&nicks, "alice bob\n").unwrap();
        let result = Registry::open(
            &nicks,
            &temp_path("accounts-bad"),
            Arc::new(CaseMapping::Ascii),
        );
        assert!(matches!(result, Err(StorageError::Malformed { .. })));
    }

    #[test]
    fn empty_lists_do_not_create_files() {
        let nicks = temp_path("nicknames-empty");
        let accounts = temp_path("accounts-empty");
        let registry = open(&nicks, &accounts);
        registry.flush().unwrap();
        assert!(!nicks.exists());
        assert!(!accounts.exists());
    }
}
