// Probabilistic membership filter approximating "already stored" (spec.md
// §3, §4.2). No crate in the reference pack provides a bloom filter (none
// of the five example repos or the other_examples corpus depend on one), so
// this is a deliberate hand-rolled exception to "never fall back to stdlib
// where the corpus shows a crate" — see DESIGN.md.
//
// Sized for 10M items at a 1% false-positive rate using the standard
// bloom-filter formulas:
//   m = -(n * ln(p)) / (ln(2)^2)
//   k = (m / n) * ln(2)

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const DEFAULT_ITEMS: u64 = 10_000_000;
const DEFAULT_FP_RATE: f64 = 0.01;

struct Bits {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl Bits {
    fn new(expected_items: u64, fp_rate: f64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(expected_items as f64) * fp_rate.ln() / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / expected_items as f64) * ln2).ceil().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes,
        }
    }

    /// Kirsch-Mitzenmacher: derive `k` independent hash indices from two
    /// SHA-256-derived 64-bit seeds, `h_i = h1 + i*h2 mod num_bits`.
    fn indices(&self, id: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(id.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        let num_bits = self.num_bits;
        (0..self.num_hashes).map(move |i| {
            h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
        })
    }

    fn insert(&self, id: &str) {
        for idx in self.indices(id).collect::<Vec<_>>() {
            let word = (idx / 64) as usize;
            let bit = idx % 64;
            self.bits[word].fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.indices(id).all(|idx| {
            let word = (idx / 64) as usize;
            let bit = idx % 64;
            self.bits[word].load(Ordering::Relaxed) & (1 << bit) != 0
        })
    }
}

/// A process-local approximate set of event ids. `insert` is called on
/// every successful Store write; `contains` is consulted before enqueueing
/// to short-circuit duplicates. False positives are allowed; false
/// negatives are forbidden once an insert has returned.
pub struct MembershipFilter {
    inner: RwLock<Arc<Bits>>,
    expected_items: u64,
    fp_rate: f64,
}

impl MembershipFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ITEMS, DEFAULT_FP_RATE)
    }

    #[must_use]
    pub fn with_capacity(expected_items: u64, fp_rate: f64) -> Self {
        Self {
            inner: RwLock::new(Arc::new(Bits::new(expected_items, fp_rate))),
            expected_items,
            fp_rate,
        }
    }

    pub fn insert(&self, id: &str) {
        self.inner.read().unwrap().insert(id);
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap().contains(id)
    }

    /// Scan `ids` into a fresh filter and atomically swap the pointer, per
    /// spec.md §4.2's `Rebuild()`.
    pub fn rebuild<I: IntoIterator<Item = String>>(&self, ids: I) {
        let fresh = Bits::new(self.expected_items, self.fp_rate);
        for id in ids {
            fresh.insert(&id);
        }
        *self.inner.write().unwrap() = Arc::new(fresh);
    }
}

impl Default for MembershipFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_ids_are_always_reported_present() {
        let filter = MembershipFilter::with_capacity(1000, 0.01);
        for i in 0..200 {
            let id = format!("id-{i}");
            filter.insert(&id);
            assert!(filter.contains(&id));
        }
    }

    #[test]
    fn a_fresh_filter_reports_nothing_present() {
        let filter = MembershipFilter::with_capacity(1000, 0.01);
        assert!(!filter.contains("never-inserted"));
    }

    #[test]
    fn rebuild_preserves_previously_inserted_ids() {
        let filter = MembershipFilter::with_capacity(1000, 0.01);
        let ids: Vec<String> = (0..50).map(|i| format!("rebuilt-{i}")).collect();
        filter.rebuild(ids.clone());
        for id in &ids {
            assert!(filter.contains(id));
        }
    }

    #[test]
    fn false_positive_rate_stays_within_an_order_of_magnitude_of_target() {
        let filter = MembershipFilter::with_capacity(2000, 0.01);
        for i in 0..2000 {
            filter.insert(&format!("present-{i}"));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.contains(&format!("absent-{i}")))
            .count();
        assert!(
            (false_positives as f64 / 10_000.0) < 0.05,
            "false positive rate too high: {false_positives}/10000"
        );
    }
}
