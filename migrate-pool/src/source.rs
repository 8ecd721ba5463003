use migrate_common::HARD_LIMIT_PER_IDENTITY;

use crate::client::ServiceClient;

/// One authenticated identity with its own independent service-protection
/// quota. The core treats a source as opaque except for these three
/// operations; richer providers (device-code, client-secret, managed-identity)
/// are external collaborators that implement this trait.
pub trait ConnectionSource: Send + Sync {
    /// Stable, unique identifier for this identity.
    fn name(&self) -> &str;

    /// Produces a fresh authenticated handle. The pool clones this once at
    /// startup to seed the source, then derives further pooled clients from
    /// the seed via `ServiceClient::box_clone`.
    fn seed_client(&self) -> Box<dyn ServiceClient>;

    /// The live, current degree of parallelism recommendation, capped at
    /// [`HARD_LIMIT_PER_IDENTITY`]. Read fresh on every call so the pool
    /// adapts if the server's recommendation changes mid-run.
    fn max_dop(&self) -> u32;
}

/// A minimal [`ConnectionSource`] backed by a pre-obtained bearer token and a
/// fixed DOP, good enough to run the pool and executor without a real auth
/// stack. Richer auth flows (device-code, client-secret, managed-identity)
/// are out of scope for the core and implement the same trait.
pub struct StaticTokenSource {
    name: String,
    seed: Box<dyn ServiceClient>,
    max_dop: u32,
}

impl StaticTokenSource {
    /// `seed` is cloned to produce every subsequent pooled client for this
    /// source; callers typically construct it from a bearer token plus a
    /// base URL via their own `ServiceClient` implementation.
    pub fn new(name: impl Into<String>, seed: Box<dyn ServiceClient>, max_dop: u32) -> Self {
        Self {
            name: name.into(),
            seed,
            max_dop: max_dop.min(HARD_LIMIT_PER_IDENTITY),
        }
    }
}

impl ConnectionSource for StaticTokenSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed_client(&self) -> Box<dyn ServiceClient> {
        self.seed.box_clone()
    }

    fn max_dop(&self) -> u32 {
        self.max_dop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServiceClient;

    #[test]
    fn caps_max_dop_at_hard_limit() {
        let source = StaticTokenSource::new("a", Box::new(MockServiceClient::new("a")), 999);
        assert_eq!(source.max_dop(), HARD_LIMIT_PER_IDENTITY);
    }

    #[test]
    fn seed_client_is_a_fresh_clone() {
        let source = StaticTokenSource::new("a", Box::new(MockServiceClient::new("a")), 4);
        let _c1 = source.seed_client();
        let _c2 = source.seed_client();
    }
}
