// Stateless Validate(e) -> (accepted, reason) predicate (spec.md §4.4).
// Checks run in order; the first failure short-circuits and its message is
// the advisory string returned in the `OK` frame.

use relay_protocol::{Event, EventClass};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, XOnlyPublicKey};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct ValidatorConfig {
    pub max_content_length: usize,
    pub max_tags: usize,
    pub past_skew_secs: i64,
    pub future_skew_secs: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_content_length: 64 * 1024,
            max_tags: 2000,
            past_skew_secs: 15 * 60,
            future_skew_secs: 15 * 60,
        }
    }
}

fn is_lowercase_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Looks up an already-fetched target event's pubkey for deletion-authority
/// checks. The caller (Processor) supplies this since only it has a Store
/// handle; the Validator itself stays pure and storage-free.
pub trait DeletionTargetLookup {
    fn pubkey_of(&self, target_id: &str) -> Option<String>;
}

/// `Validate` with no deletion targets to check (used when the caller
/// doesn't need deletion-authority enforcement, e.g. structural-only tests).
pub struct NoTargets;
impl DeletionTargetLookup for NoTargets {
    fn pubkey_of(&self, _target_id: &str) -> Option<String> {
        None
    }
}

pub fn validate(
    e: &Event,
    config: &ValidatorConfig,
    targets: &impl DeletionTargetLookup,
) -> Result<(), String> {
    if !is_lowercase_hex(&e.id, 64) {
        return Err("invalid: id is not 32-byte lowercase hex".to_owned());
    }
    if !is_lowercase_hex(&e.pubkey, 64) {
        return Err("invalid: pubkey is not 32-byte lowercase hex".to_owned());
    }
    if !is_lowercase_hex(&e.sig, 128) {
        return Err("invalid: sig is not 64-byte lowercase hex".to_owned());
    }
    if !(0..=65535).contains(&e.kind) {
        return Err("invalid: kind out of range".to_owned());
    }
    if e.content.len() > config.max_content_length {
        return Err("invalid: content too long".to_owned());
    }
    if e.tags.len() > config.max_tags {
        return Err("invalid: too many tags".to_owned());
    }

    if !e.id_matches_canonical_hash() {
        return Err("invalid: id does not match canonical hash".to_owned());
    }

    if let Err(reason) = verify_signature(e) {
        return Err(reason);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    if e.created_at < now - config.past_skew_secs {
        return Err("invalid: created_at too far in the past".to_owned());
    }
    if e.created_at > now + config.future_skew_secs {
        return Err("invalid: created_at too far in the future".to_owned());
    }

    if matches!(e.class(), EventClass::Deletion) {
        for target_id in e.tag_values("e") {
            if let Some(target_pubkey) = targets.pubkey_of(target_id) {
                if target_pubkey != e.pubkey {
                    return Err(
                        "invalid: deletion target belongs to a different pubkey".to_owned()
                    );
                }
            }
        }
    }

    Ok(())
}

fn verify_signature(e: &Event) -> Result<(), String> {
    let id_bytes = hex::decode(&e.id).map_err(|_| "invalid: id is not hex".to_owned())?;
    let pubkey_bytes =
        hex::decode(&e.pubkey).map_err(|_| "invalid: pubkey is not hex".to_owned())?;
    let sig_bytes = hex::decode(&e.sig).map_err(|_| "invalid: sig is not hex".to_owned())?;

    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|_| "invalid: id is not a valid 32-byte digest".to_owned())?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|_| "invalid: pubkey is not a valid x-only public key".to_owned())?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| "invalid: malformed signature".to_owned())?;

    signature
        .verify(&message, &pubkey)
        .map_err(|_| "invalid: signature does not verify".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Keypair, Secp256k1};

    fn signed_event(content: &str, kind: i64, created_at: i64) -> Event {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (xonly, _parity) = keypair.x_only_public_key();

        let mut e = Event {
            id: String::new(),
            pubkey: hex::encode(xonly.serialize()),
            created_at,
            kind,
            tags: vec![],
            content: content.to_owned(),
            sig: String::new(),
        };
        e.id = e.computed_id();
        let digest = hex::decode(&e.id).unwrap();
        let message = Message::from_digest_slice(&digest).unwrap();
        let sig = secp.sign_schnorr(&message, &keypair);
        e.sig = hex::encode(sig.as_ref());
        e
    }

    #[test]
    fn accepts_a_well_formed_signed_event() {
        let e = signed_event("hello", 1, 1_700_000_000);
        assert!(validate(&e, &ValidatorConfig::default(), &NoTargets).is_ok());
    }

    #[test]
    fn rejects_tampered_content_after_signing() {
        let mut e = signed_event("hello", 1, 1_700_000_000);
        e.content = "goodbye".to_owned();
        let result = validate(&e, &ValidatorConfig::default(), &NoTargets);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_kind_above_the_valid_range() {
        let mut e = signed_event("hello", 1, 1_700_000_000);
        e.kind = 65536;
        let result = validate(&e, &ValidatorConfig::default(), &NoTargets);
        assert_eq!(result, Err("invalid: kind out of range".to_owned()));
    }

    #[test]
    fn accepts_kind_zero_and_max_kind() {
        let e0 = signed_event("hi", 0, 1_700_000_000);
        assert!(validate(&e0, &ValidatorConfig::default(), &NoTargets).is_ok());
        let e_max = signed_event("hi", 65535, 1_700_000_000);
        assert!(validate(&e_max, &ValidatorConfig::default(), &NoTargets).is_ok());
    }

    #[test]
    fn rejects_created_at_far_in_the_future() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let e = signed_event("hi", 1, now + 100_000);
        let result = validate(&e, &ValidatorConfig::default(), &NoTargets);
        assert_eq!(result, Err("invalid: created_at too far in the future".to_owned()));
    }

    struct FixedTargets(String);
    impl DeletionTargetLookup for FixedTargets {
        fn pubkey_of(&self, _target_id: &str) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn rejects_deletion_of_a_target_owned_by_another_pubkey() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (xonly, _parity) = keypair.x_only_public_key();

        let mut e = Event {
            id: String::new(),
            pubkey: hex::encode(xonly.serialize()),
            created_at: 1_700_000_000,
            kind: 5,
            tags: vec![vec!["e".to_owned(), "deadbeef".to_owned()]],
            content: String::new(),
            sig: String::new(),
        };
        e.id = e.computed_id();
        let digest = hex::decode(&e.id).unwrap();
        let message = Message::from_digest_slice(&digest).unwrap();
        let sig = secp.sign_schnorr(&message, &keypair);
        e.sig = hex::encode(sig.as_ref());

        let targets = FixedTargets("some-other-pubkey".to_owned());
        let result = validate(&e, &ValidatorConfig::default(), &targets);
        assert_eq!(
            result,
            Err("invalid: deletion target belongs to a different pubkey".to_owned())
        );
    }
}
