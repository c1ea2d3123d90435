use sha2::{Digest, Sha256};

/// Length of derived unique suffixes. Short enough to fit provider name
/// limits, long enough that collisions within one scope are not a concern.
const UNIQUE_LEN: usize = 13;

/// Derive a deterministic, case-normalized unique string from a set of
/// caller-invariant seeds (scope identifier, declared prefix, ...).
///
/// The same inputs always produce the same output, which is what makes
/// re-apply detection work for globally-unique resource names: the engine
/// never has to remember a generated name, it can always re-derive it.
pub fn unique_string<'a, I>(seeds: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed.as_bytes());
        // Separator prevents ("ab", "c") colliding with ("a", "bc").
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = hex::encode(digest);
    out.truncate(UNIQUE_LEN);
    out
}
