//! Time-rotating credentials derived from a secret key.
//!
//! A credential is `hash(key ++ epoch)` laid out as a UUID. Nothing is stored:
//! anyone holding the key and the current time can recompute it, and it changes
//! every time the epoch advances.

use crate::defaults;
use crate::error::Result;
use crate::hash::{Hasher, checked_digest};

const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
/// Name-based MD5 version nibble.
const VERSION_NIBBLE: u8 = b'3';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    canonical: String,
    compact: String,
}

impl Credential {
    /// Builds both textual forms from a 32-char hex digest, stamping the
    /// version and variant nibbles so the canonical form is a valid UUID.
    fn from_digest(digest: &str) -> Self {
        let mut bytes = digest.as_bytes().to_vec();
        bytes[12] = VERSION_NIBBLE;
        let variant = (hex_value(bytes[16]) & 0x3) | 0x8;
        bytes[16] = b"0123456789abcdef"[variant as usize];
        let compact: String = bytes.iter().map(|&b| b as char).collect();

        let mut canonical = String::with_capacity(36);
        let mut offset = 0;
        for (i, len) in GROUPS.iter().enumerate() {
            if i > 0 {
                canonical.push('-');
            }
            canonical.push_str(&compact[offset..offset + len]);
            offset += len;
        }

        Self { canonical, compact }
    }

    /// 36-char dashed form.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// 32-char undashed form.
    pub fn compact(&self) -> &str {
        &self.compact
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

/// Derives the credential for `key` in `epoch`.
pub fn derive_credential<H: Hasher + ?Sized>(
    hasher: &H,
    key: &str,
    epoch: u64,
) -> Result<Credential> {
    let digest = checked_digest(hasher, format!("{key}{epoch}").as_bytes())?;
    Ok(Credential::from_digest(&digest))
}

/// Whether `s` is already a UUID (8-4-4-4-12 hex, version 1-5, variant 8/9/a/b).
/// Case-insensitive.
pub fn is_canonical(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, &b) in bytes.iter().enumerate() {
        let ok = match i {
            8 | 13 | 18 | 23 => b == b'-',
            14 => matches!(b, b'1'..=b'5'),
            19 => matches!(b.to_ascii_lowercase(), b'8' | b'9' | b'a' | b'b'),
            _ => b.is_ascii_hexdigit(),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// How long a credential lives and how often it rotates, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    valid_secs: u64,
    update_secs: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            valid_secs: defaults::VALID_SECS,
            update_secs: defaults::UPDATE_SECS,
        }
    }
}

impl RotationPolicy {
    /// Returns `None` unless `0 < update_secs <= valid_secs` and a credential
    /// spans at most [`defaults::MAX_ACCEPTED_EPOCHS`] intervals.
    pub fn new(valid_secs: u64, update_secs: u64) -> Option<Self> {
        let ok = update_secs > 0
            && update_secs <= valid_secs
            && valid_secs.div_ceil(update_secs) <= defaults::MAX_ACCEPTED_EPOCHS;
        ok.then_some(Self {
            valid_secs,
            update_secs,
        })
    }

    pub fn valid_secs(&self) -> u64 {
        self.valid_secs
    }

    pub fn update_secs(&self) -> u64 {
        self.update_secs
    }

    /// Start of the rotation interval containing `now_secs`.
    pub fn epoch(&self, now_secs: u64) -> u64 {
        now_secs / self.update_secs * self.update_secs
    }

    /// Epochs whose credentials are still acceptable at `now_secs`, newest first.
    pub fn accepted_epochs(&self, now_secs: u64) -> Vec<u64> {
        let mut epochs = Vec::new();
        let mut epoch = self.epoch(now_secs);
        loop {
            if epoch.saturating_add(self.valid_secs) <= now_secs {
                break;
            }
            epochs.push(epoch);
            match epoch.checked_sub(self.update_secs) {
                Some(prev) => epoch = prev,
                None => break,
            }
        }
        epochs
    }
}

/// Start of the UTC day containing `now_secs`.
pub fn day_epoch(now_secs: u64) -> u64 {
    now_secs - now_secs % defaults::DAY_SECS
}

/// Credential for the current rotation interval.
pub fn current_credential<H: Hasher + ?Sized>(
    hasher: &H,
    key: &str,
    policy: &RotationPolicy,
    now_secs: u64,
) -> Result<Credential> {
    derive_credential(hasher, key, policy.epoch(now_secs))
}

/// Every credential a client may still present at `now_secs`, newest first.
pub fn accepted_credentials<H: Hasher + ?Sized>(
    hasher: &H,
    key: &str,
    policy: &RotationPolicy,
    now_secs: u64,
) -> Result<Vec<Credential>> {
    policy
        .accepted_epochs(now_secs)
        .into_iter()
        .map(|epoch| derive_credential(hasher, key, epoch))
        .collect()
}

/// Day-stable identity derived from the primary credential, used as a decoy
/// wherever the real one must not appear.
pub fn decoy_credential<H: Hasher + ?Sized>(
    hasher: &H,
    primary: &str,
    now_secs: u64,
) -> Result<Credential> {
    derive_credential(hasher, primary, day_epoch(now_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hash::Md5Hasher;

    struct Broken;

    impl Hasher for Broken {
        fn hex_digest(&self, _: &[u8]) -> Result<String> {
            Err(Error::Derivation("subtle crypto unavailable".into()))
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_credential(&Md5Hasher, "secret", 1_700_000_000).unwrap();
        let b = derive_credential(&Md5Hasher, "secret", 1_700_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn epochs_give_distinct_credentials() {
        let a = derive_credential(&Md5Hasher, "secret", 0).unwrap();
        let b = derive_credential(&Md5Hasher, "secret", 43_200).unwrap();
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn canonical_shape() {
        for epoch in 0..64 {
            let cred = derive_credential(&Md5Hasher, "k", epoch * 43_200).unwrap();
            assert!(is_canonical(cred.canonical()), "{}", cred.canonical());
            assert_eq!(cred.canonical().len(), 36);
            assert_eq!(cred.compact().len(), 32);
            assert_eq!(cred.canonical().replace('-', ""), cred.compact());
        }
    }

    #[test]
    fn layout_follows_digest() {
        let digest = checked_digest(&Md5Hasher, b"secret0").unwrap();
        let cred = derive_credential(&Md5Hasher, "secret", 0).unwrap();
        assert_eq!(&cred.compact()[..12], &digest[..12]);
        assert_eq!(&cred.compact()[17..], &digest[17..]);
    }

    #[test]
    fn hash_failure_propagates() {
        let err = derive_credential(&Broken, "secret", 0).unwrap_err();
        assert!(matches!(err, Error::Derivation(_)));
    }

    #[test]
    fn canonical_check() {
        assert!(is_canonical("d342d11e-d424-4583-b36e-524ab1f0afa4"));
        assert!(is_canonical("D342D11E-D424-4583-B36E-524AB1F0AFA4"));
        // version 6
        assert!(!is_canonical("d342d11e-d424-6583-b36e-524ab1f0afa4"));
        // variant c
        assert!(!is_canonical("d342d11e-d424-4583-c36e-524ab1f0afa4"));
        assert!(!is_canonical("d342d11ed4244583b36e524ab1f0afa4"));
        assert!(!is_canonical("my-password"));
        assert!(!is_canonical(""));
    }

    #[test]
    fn policy_validation() {
        assert!(RotationPolicy::new(86_400, 43_200).is_some());
        assert!(RotationPolicy::new(100, 100).is_some());
        assert!(RotationPolicy::new(100, 200).is_none());
        assert!(RotationPolicy::new(100, 0).is_none());
    }

    #[test]
    fn policy_rejects_wide_windows() {
        assert!(RotationPolicy::new(u64::MAX, 43_200).is_none());
        assert!(RotationPolicy::new(2_592_000, 60).is_none());
        let widest = defaults::MAX_ACCEPTED_EPOCHS * 60;
        assert!(RotationPolicy::new(widest, 60).is_some());
        assert!(RotationPolicy::new(widest + 1, 60).is_none());
    }

    #[test]
    fn window_never_overflows() {
        let policy = RotationPolicy::new(u64::MAX, u64::MAX).unwrap();
        assert_eq!(policy.accepted_epochs(1_760_000_000), vec![0]);

        let widest = RotationPolicy::new(defaults::MAX_ACCEPTED_EPOCHS * 60, 60).unwrap();
        let epochs = widest.accepted_epochs(1_760_000_030);
        assert_eq!(epochs.len() as u64, defaults::MAX_ACCEPTED_EPOCHS);
    }

    #[test]
    fn epoch_is_interval_aligned() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.epoch(43_199), 0);
        assert_eq!(policy.epoch(43_200), 43_200);
        assert_eq!(policy.epoch(100_000), 86_400);
    }

    #[test]
    fn stable_within_interval() {
        let policy = RotationPolicy::default();
        let a = current_credential(&Md5Hasher, "k", &policy, 86_401).unwrap();
        let b = current_credential(&Md5Hasher, "k", &policy, 129_599).unwrap();
        let c = current_credential(&Md5Hasher, "k", &policy, 129_600).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn acceptance_window_covers_previous_interval() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.accepted_epochs(100_000), vec![86_400, 43_200]);
        assert_eq!(policy.accepted_epochs(10), vec![0]);

        let tight = RotationPolicy::new(3_600, 3_600).unwrap();
        assert_eq!(tight.accepted_epochs(7_300), vec![7_200]);

        let creds = accepted_credentials(&Md5Hasher, "k", &policy, 100_000).unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0], current_credential(&Md5Hasher, "k", &policy, 100_000).unwrap());
    }

    #[test]
    fn decoy_is_stable_for_the_day() {
        let primary = "d342d11e-d424-4583-b36e-524ab1f0afa4";
        let morning = decoy_credential(&Md5Hasher, primary, 86_400 + 60).unwrap();
        let evening = decoy_credential(&Md5Hasher, primary, 2 * 86_400 - 1).unwrap();
        let next_day = decoy_credential(&Md5Hasher, primary, 2 * 86_400).unwrap();
        assert_eq!(morning, evening);
        assert_ne!(evening, next_day);
        assert_eq!(day_epoch(86_400 + 60), 86_400);
    }
}
