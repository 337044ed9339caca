//! Host key repository backed by an OpenSSH `known_hosts` file.
//!
//! Supported line forms:
//!
//! - plain, comma-separated, wildcard (`*`, `?`) and negated (`!`) patterns
//! - hashed host names (`|1|salt|hash`, HMAC-SHA1)
//! - `@revoked` markers: a revoked key is reported as changed
//!
//! `@cert-authority` lines are ignored; certificate host keys are not
//! supported.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use agit_core::{HostKeyError, HostKeyRepository, HostKeyStatus, UserInfo};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use ssh_key::PublicKey;
use ssh_key::known_hosts::{HostPatterns, KnownHosts, Marker};
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
struct KnownHost {
    hosts: HostPatterns,
    key: Vec<u8>,
    revoked: bool,
}

impl KnownHost {
    fn matches(&self, host: &str) -> bool {
        match &self.hosts {
            HostPatterns::Patterns(patterns) => patterns_match(patterns, host),
            HostPatterns::HashedName { salt, hash } => hashed_match(salt, hash, host),
        }
    }
}

/// OpenSSH pattern-list semantics: any negated match vetoes the line.
fn patterns_match(patterns: &[String], host: &str) -> bool {
    let host = host.to_lowercase();
    let mut matched = false;
    for pattern in patterns {
        let pattern = pattern.to_lowercase();
        if let Some(negated) = pattern.strip_prefix('!') {
            if WildMatch::new(negated).matches(&host) {
                return false;
            }
        } else if WildMatch::new(&pattern).matches(&host) {
            matched = true;
        }
    }
    matched
}

fn hashed_match(salt: &[u8], hash: &[u8; 20], host: &str) -> bool {
    let Ok(mut mac) = HmacSha1::new_from_slice(salt) else {
        return false;
    };
    mac.update(host.to_lowercase().as_bytes());
    mac.verify_slice(hash).is_ok()
}

fn parse(content: &str, origin: &Path) -> Vec<KnownHost> {
    let mut hosts = Vec::new();
    for (index, entry) in KnownHosts::new(content).enumerate() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %origin.display(), entry = index + 1, "skipping malformed known_hosts entry: {e}");
                continue;
            }
        };
        let revoked = match entry.marker() {
            Some(Marker::CertAuthority) => continue,
            Some(Marker::Revoked) => true,
            None => false,
        };
        let key = match entry.public_key().to_bytes() {
            Ok(k) => k,
            Err(e) => {
                warn!(path = %origin.display(), "skipping unencodable known_hosts key: {e}");
                continue;
            }
        };
        hosts.push(KnownHost {
            hosts: entry.host_patterns().clone(),
            key,
            revoked,
        });
    }
    hosts
}

pub struct KnownHostsRepository {
    path: PathBuf,
    id: String,
    entries: RwLock<Vec<KnownHost>>,
    prompt: Option<Arc<dyn UserInfo>>,
}

impl std::fmt::Debug for KnownHostsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownHostsRepository")
            .field("path", &self.path)
            .field("prompt", &self.prompt.is_some())
            .finish_non_exhaustive()
    }
}

impl KnownHostsRepository {
    /// Load `path`.  A missing file is an empty repository.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HostKeyError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => parse(&content, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "known_hosts not found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = entries.len(), "loaded known_hosts");
        Ok(Self {
            id: path.display().to_string(),
            path,
            entries: RwLock::new(entries),
            prompt: None,
        })
    }

    /// Ask `user_info` about hosts with no recorded key.
    ///
    /// Accepted keys are appended to the file.  Changed and revoked keys are
    /// never put to the user.
    pub fn with_prompt(mut self, user_info: Arc<dyn UserInfo>) -> Self {
        self.prompt = Some(user_info);
        self
    }

    fn lookup(&self, host: &str, key: &[u8]) -> HostKeyStatus {
        let Ok(entries) = self.entries.read() else {
            warn!("known_hosts lock poisoned");
            return HostKeyStatus::Unknown;
        };
        let mut recorded = false;
        let mut trusted = false;
        for entry in entries.iter().filter(|e| e.matches(host)) {
            if entry.revoked {
                if entry.key == key {
                    warn!(%host, "host presented a revoked key");
                    return HostKeyStatus::Changed;
                }
                continue;
            }
            recorded = true;
            trusted |= entry.key == key;
        }
        match (recorded, trusted) {
            (_, true) => HostKeyStatus::Trusted,
            (true, false) => HostKeyStatus::Changed,
            (false, false) => HostKeyStatus::Unknown,
        }
    }

    fn ask(&self, ui: &dyn UserInfo, host: &str, key: &[u8]) -> HostKeyStatus {
        let fingerprint =
            agit_core::fingerprint(key).unwrap_or_else(|| "(unparseable key)".to_string());
        let algorithm = agit_core::key_algorithm(key).unwrap_or("unknown");
        let accepted = ui.prompt_yes_no(&format!(
            "The authenticity of host '{host}' can't be established.\n\
             {algorithm} key fingerprint is {fingerprint}.\n\
             Are you sure you want to continue connecting?"
        ));
        if !accepted {
            debug!(%host, "user declined unknown host key");
            return HostKeyStatus::Unknown;
        }
        if let Err(e) = self.add(host, key) {
            warn!(%host, path = %self.path.display(), "accepted host key could not be saved: {e}");
            ui.show_message(&format!(
                "Warning: could not record the host key for '{host}' in {}: {e}",
                self.path.display()
            ));
            self.remember(host, key);
        }
        HostKeyStatus::Trusted
    }

    /// Trust `key` for `host` until this repository is dropped.
    fn remember(&self, host: &str, key: &[u8]) {
        match self.entries.write() {
            Ok(mut entries) => entries.push(KnownHost {
                hosts: HostPatterns::Patterns(vec![host.to_string()]),
                key: key.to_vec(),
                revoked: false,
            }),
            Err(_) => warn!("known_hosts lock poisoned"),
        }
    }
}

impl HostKeyRepository for KnownHostsRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self, host: &str, key: &[u8]) -> HostKeyStatus {
        let status = self.lookup(host, key);
        match (status, &self.prompt) {
            (HostKeyStatus::Unknown, Some(ui)) => self.ask(ui.as_ref(), host, key),
            _ => status,
        }
    }

    fn add(&self, host: &str, key: &[u8]) -> Result<(), HostKeyError> {
        let openssh = PublicKey::from_bytes(key)
            .and_then(|k| k.to_openssh())
            .map_err(|e| HostKeyError::MalformedKey(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{host} {}", openssh.trim_end())?;

        self.remember(host, key);
        info!(%host, path = %self.path.display(), "recorded host key");
        Ok(())
    }

    fn keys_for(&self, host: &str) -> Vec<Vec<u8>> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| !e.revoked && e.matches(host))
            .map(|e| e.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::{BASE64_STANDARD, Engine};
    use ssh_key::public::{Ed25519PublicKey, KeyData};
    use zeroize::Zeroizing;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from(KeyData::Ed25519(Ed25519PublicKey([seed; 32])))
    }

    fn blob(seed: u8) -> Vec<u8> {
        key(seed).to_bytes().unwrap()
    }

    fn line(hosts: &str, seed: u8) -> String {
        format!("{hosts} {}\n", key(seed).to_openssh().unwrap())
    }

    fn repo_with(content: &str) -> (tempfile::TempDir, KnownHostsRepository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, content).unwrap();
        let repo = KnownHostsRepository::open(&path).unwrap();
        (dir, repo)
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = KnownHostsRepository::open(dir.path().join("absent")).unwrap();
        assert_eq!(repo.check("github.com", &blob(1)), HostKeyStatus::Unknown);
    }

    #[test]
    fn plain_entries() {
        let (_dir, repo) = repo_with(&line("github.com,140.82.112.3", 1));
        assert_eq!(repo.check("github.com", &blob(1)), HostKeyStatus::Trusted);
        assert_eq!(repo.check("140.82.112.3", &blob(1)), HostKeyStatus::Trusted);
        assert_eq!(repo.check("github.com", &blob(2)), HostKeyStatus::Changed);
        assert_eq!(repo.check("gitlab.com", &blob(1)), HostKeyStatus::Unknown);
    }

    #[test]
    fn host_names_are_case_insensitive() {
        let (_dir, repo) = repo_with(&line("GitHub.com", 1));
        assert_eq!(repo.check("github.COM", &blob(1)), HostKeyStatus::Trusted);
    }

    #[test]
    fn non_default_port_entries() {
        let (_dir, repo) = repo_with(&line("[git.example.com]:2222", 3));
        assert_eq!(
            repo.check("[git.example.com]:2222", &blob(3)),
            HostKeyStatus::Trusted
        );
        assert_eq!(repo.check("git.example.com", &blob(3)), HostKeyStatus::Unknown);
    }

    #[test]
    fn wildcard_and_negation() {
        let (_dir, repo) = repo_with(&line("*.corp.example,!bastion.corp.example", 4));
        assert_eq!(repo.check("git.corp.example", &blob(4)), HostKeyStatus::Trusted);
        assert_eq!(
            repo.check("bastion.corp.example", &blob(4)),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn hashed_entries() {
        let salt = [0x5au8; 20];
        let mut mac = HmacSha1::new_from_slice(&salt).unwrap();
        mac.update(b"hidden.example");
        let hash = mac.finalize().into_bytes();
        let hashed = format!(
            "|1|{}|{}",
            BASE64_STANDARD.encode(salt),
            BASE64_STANDARD.encode(hash)
        );

        let (_dir, repo) = repo_with(&line(&hashed, 5));
        assert_eq!(repo.check("hidden.example", &blob(5)), HostKeyStatus::Trusted);
        assert_eq!(repo.check("Hidden.EXAMPLE", &blob(5)), HostKeyStatus::Trusted);
        assert_eq!(repo.check("other.example", &blob(5)), HostKeyStatus::Unknown);
    }

    #[test]
    fn revoked_key_reports_changed() {
        let content = format!("@revoked {}{}", line("*", 6), line("host.example", 7));
        let (_dir, repo) = repo_with(&content);
        assert_eq!(repo.check("host.example", &blob(6)), HostKeyStatus::Changed);
        assert_eq!(repo.check("host.example", &blob(7)), HostKeyStatus::Trusted);
        assert_eq!(repo.keys_for("host.example"), vec![blob(7)]);
    }

    #[test]
    fn cert_authority_lines_are_ignored() {
        let content = format!("@cert-authority {}", line("*.example", 8));
        let (_dir, repo) = repo_with(&content);
        assert_eq!(repo.check("a.example", &blob(8)), HostKeyStatus::Unknown);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = format!("this is not a key line\n{}", line("ok.example", 9));
        let (_dir, repo) = repo_with(&content);
        assert_eq!(repo.check("ok.example", &blob(9)), HostKeyStatus::Trusted);
    }

    #[test]
    fn add_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");
        let repo = KnownHostsRepository::open(&path).unwrap();

        repo.add("[new.example]:2200", &blob(10)).unwrap();
        assert_eq!(
            repo.check("[new.example]:2200", &blob(10)),
            HostKeyStatus::Trusted
        );

        let reopened = KnownHostsRepository::open(&path).unwrap();
        assert_eq!(
            reopened.check("[new.example]:2200", &blob(10)),
            HostKeyStatus::Trusted
        );
    }

    #[test]
    fn add_rejects_garbage_key() {
        let dir = tempfile::tempdir().unwrap();
        let repo = KnownHostsRepository::open(dir.path().join("known_hosts")).unwrap();
        assert!(matches!(
            repo.add("h", &[0xab, 0xcd]),
            Err(HostKeyError::MalformedKey(_))
        ));
    }

    #[derive(Debug, Default)]
    struct Answer(bool, std::sync::Mutex<Vec<String>>);

    fn answer(yes: bool) -> Arc<Answer> {
        Arc::new(Answer(yes, Default::default()))
    }

    impl UserInfo for Answer {
        fn prompt_passphrase(&self, _message: &str) -> Option<Zeroizing<String>> {
            None
        }
        fn prompt_password(&self, _message: &str) -> Option<Zeroizing<String>> {
            None
        }
        fn prompt_yes_no(&self, _message: &str) -> bool {
            self.0
        }
        fn show_message(&self, message: &str) {
            self.1.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn prompting_repository_records_accepted_host() {
        let (_dir, repo) = repo_with("");
        let repo = repo.with_prompt(answer(true));
        assert_eq!(repo.check("fresh.example", &blob(11)), HostKeyStatus::Trusted);
        assert_eq!(repo.keys_for("fresh.example"), vec![blob(11)]);
    }

    #[cfg(unix)]
    #[test]
    fn accepted_host_stays_trusted_when_file_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every append fail.
        let path = dir.path().join("known_hosts");
        std::fs::create_dir(&path).unwrap();
        let ui = answer(true);
        let repo = KnownHostsRepository::open(dir.path().join("absent"))
            .unwrap()
            .with_prompt(ui.clone());
        let repo = KnownHostsRepository { path, ..repo };

        assert_eq!(repo.check("fresh.example", &blob(15)), HostKeyStatus::Trusted);
        assert_eq!(repo.keys_for("fresh.example"), vec![blob(15)]);
        let messages = ui.1.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("could not record"));
    }

    #[test]
    fn prompting_repository_respects_decline() {
        let (_dir, repo) = repo_with("");
        let repo = repo.with_prompt(answer(false));
        assert_eq!(repo.check("fresh.example", &blob(12)), HostKeyStatus::Unknown);
        assert!(repo.keys_for("fresh.example").is_empty());
    }

    #[test]
    fn prompting_repository_never_overrides_changed_key() {
        let (_dir, repo) = repo_with(&line("seen.example", 13));
        let repo = repo.with_prompt(answer(true));
        assert_eq!(repo.check("seen.example", &blob(14)), HostKeyStatus::Changed);
    }
}
