//! Session setup: key generation and the public / secret capability split.
//!
//! [`EncryptionContext::create`] is the trusted setup step. It hands back the
//! context (public material only) and a [`KeyPair`] whose secret half can only
//! be consumed by a [`Decryptor`](crate::decryptor::Decryptor). Contributors and
//! the aggregator get a [`PublicContext`], which has no path to the secret key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use fhe::bfv::{
    BfvParameters, BfvParametersBuilder, Encoding, EvaluationKey, EvaluationKeyBuilder,
    Plaintext as BfvPlaintext, PublicKey, SecretKey as BfvSecretKey,
};
use fhe_traits::{FheEncoder, FheEncrypter};
use log::{debug, info};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore, SeedableRng, TryRngCore};
use rand_chacha::ChaCha20Rng;

use crate::cipher::EncryptedValue;
use crate::codec::{EncodingCodec, Plaintext, RawValue};
use crate::error::{Error, Result};
use crate::params::{ContextParams, SchemeKind};

/// Identity of one generated context. Ciphertexts only combine when their
/// identities (and parameters) agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{:016x}", self.0)
    }
}

/// `(ring degree, plaintext modulus, modulus chain)`.
type BackendKey = (usize, u64, Vec<usize>);

/// Live backend parameter handles, one per distinct parameter set. The
/// backend only combines objects built on the same handle, so contexts
/// regenerated from the same seed must reuse it.
static BACKENDS: OnceLock<Mutex<HashMap<BackendKey, Weak<BfvParameters>>>> = OnceLock::new();

fn shared_backend(params: &ContextParams, plaintext_modulus: u64) -> Result<Arc<BfvParameters>> {
    let key = (params.ring_degree, plaintext_modulus, params.modulus_chain.clone());
    let mut backends = BACKENDS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(live) = backends.get(&key).and_then(Weak::upgrade) {
        return Ok(live);
    }
    let bfv = BfvParametersBuilder::new()
        .set_degree(params.ring_degree)
        .set_plaintext_modulus(plaintext_modulus)
        .set_moduli_sizes(&params.modulus_chain)
        .build_arc()?;
    backends.retain(|_, handle| handle.strong_count() > 0);
    backends.insert(key, Arc::downgrade(&bfv));
    Ok(bfv)
}

/// Immutable public state shared (via `Arc`) by every handle of a session.
pub(crate) struct ContextCore {
    pub(crate) id: ContextId,
    pub(crate) params: ContextParams,
    pub(crate) codec: EncodingCodec,
    pub(crate) bfv: Arc<BfvParameters>,
    pub(crate) public_key: PublicKey,
    pub(crate) eval_key: Option<EvaluationKey>,
}

impl ContextCore {
    pub(crate) fn same_session(&self, other: &ContextCore) -> bool {
        std::ptr::eq(self, other)
            || (self.id == other.id
                && self.params == other.params
                && Arc::ptr_eq(&self.bfv, &other.bfv))
    }

    /// Full-ring backend plaintext for `pt`.
    pub(crate) fn lower(&self, pt: &Plaintext) -> Result<BfvPlaintext> {
        if pt.scheme() != self.params.scheme {
            return Err(Error::SchemeMismatch {
                expected: self.params.scheme,
                found: pt.scheme(),
            });
        }
        if pt.len() > self.params.ring_degree {
            return Err(Error::TooManySlots {
                count: pt.len(),
                capacity: self.params.ring_degree,
            });
        }
        let slots = pt.expand(self.params.ring_degree);
        Ok(BfvPlaintext::try_encode(slots.as_slice(), Encoding::simd(), &self.bfv)?)
    }
}

impl fmt::Debug for ContextCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCore")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("plaintext_modulus", &self.codec.modulus())
            .field("evaluation_keys", &self.eval_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Secret half of a [`KeyPair`]. Opaque: the only thing that can use it is
/// [`Decryptor::new`](crate::decryptor::Decryptor::new).
pub struct SecretKey {
    pub(crate) context: ContextId,
    pub(crate) inner: BfvSecretKey,
}

impl SecretKey {
    /// Session the key was generated for.
    pub fn context_id(&self) -> ContextId {
        self.context
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Output of key generation.
#[derive(Debug)]
pub struct KeyPair {
    /// Public encryption key plus evaluation keys, when generated.
    pub public: PublicContext,
    /// Belongs to the decrypting party only.
    pub secret_key: SecretKey,
}

/// Trusted-setup handle of a session.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    core: Arc<ContextCore>,
}

impl EncryptionContext {
    /// Generates a fresh context with OS randomness.
    pub fn create(params: ContextParams) -> Result<(Self, KeyPair)> {
        Self::create_with_rng(params, &mut OsRng.unwrap_err())
    }

    /// Same seed and parameters give the same context identity and secret key.
    pub fn create_seeded(params: ContextParams, seed: u64) -> Result<(Self, KeyPair)> {
        Self::create_with_rng(params, &mut ChaCha20Rng::seed_from_u64(seed))
    }

    /// Key generation driven by `rng`. The context id is drawn first, then
    /// the secret key.
    pub fn create_with_rng<R: RngCore + CryptoRng>(
        params: ContextParams,
        rng: &mut R,
    ) -> Result<(Self, KeyPair)> {
        let plaintext_modulus = params.validate()?;
        let codec =
            EncodingCodec::new(params.scheme, plaintext_modulus, params.scale.unwrap_or(1.0));
        let bfv = shared_backend(&params, plaintext_modulus)?;

        let id = ContextId(rng.next_u64());
        let secret = BfvSecretKey::random(&bfv, rng);
        let public_key = PublicKey::new(&secret, rng);
        let eval_key = if params.evaluation_keys {
            let mut builder = EvaluationKeyBuilder::new(&secret)?;
            builder.enable_inner_sum()?;
            Some(builder.build(rng)?)
        } else {
            None
        };

        info!(
            "created {} context {} (degree {}, chain {:?}, plaintext modulus {}, eval keys: {})",
            params.scheme,
            id,
            params.ring_degree,
            params.modulus_chain,
            plaintext_modulus,
            eval_key.is_some()
        );

        let core = Arc::new(ContextCore {
            id,
            params,
            codec,
            bfv,
            public_key,
            eval_key,
        });
        let keys = KeyPair {
            public: PublicContext { core: Arc::clone(&core) },
            secret_key: SecretKey { context: id, inner: secret },
        };
        Ok((Self { core }, keys))
    }

    /// Handle for contributors and the aggregator. Carries public material
    /// only.
    pub fn derive_public_view(&self) -> PublicContext {
        PublicContext {
            core: Arc::clone(&self.core),
        }
    }

    /// Session identity.
    pub fn id(&self) -> ContextId {
        self.core.id
    }

    /// Validated parameters.
    pub fn params(&self) -> &ContextParams {
        &self.core.params
    }

    /// Codec bound to the session's plaintext modulus and scale.
    pub fn codec(&self) -> &EncodingCodec {
        &self.core.codec
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.core
    }
}

/// Encryption-only view of a context; cheap to clone and share across threads.
#[derive(Debug, Clone)]
pub struct PublicContext {
    core: Arc<ContextCore>,
}

impl PublicContext {
    /// Session identity.
    pub fn id(&self) -> ContextId {
        self.core.id
    }

    /// Validated parameters.
    pub fn params(&self) -> &ContextParams {
        &self.core.params
    }

    /// Encoding family.
    pub fn scheme(&self) -> SchemeKind {
        self.core.params.scheme
    }

    /// Codec contributors encode with.
    pub fn codec(&self) -> &EncodingCodec {
        &self.core.codec
    }

    /// Number of values one ciphertext can pack.
    pub fn slot_capacity(&self) -> usize {
        self.core.params.ring_degree
    }

    /// Whether packed slots can be summed.
    pub fn has_evaluation_keys(&self) -> bool {
        self.core.eval_key.is_some()
    }

    /// Encrypts under the public key with thread-local randomness.
    pub fn encrypt(&self, plaintext: &Plaintext) -> Result<EncryptedValue> {
        self.encrypt_with_rng(plaintext, &mut rand::thread_rng())
    }

    /// Encrypts with caller-supplied randomness.
    pub fn encrypt_with_rng<R: RngCore + CryptoRng>(
        &self,
        plaintext: &Plaintext,
        rng: &mut R,
    ) -> Result<EncryptedValue> {
        if plaintext.is_empty() {
            return Err(Error::EmptyAggregation);
        }
        let pt = self.core.lower(plaintext)?;
        let ct = self.core.public_key.try_encrypt(&pt, rng)?;
        debug!("encrypted {} slot(s) under {}", plaintext.len(), self.core.id);
        Ok(EncryptedValue::fresh(
            ct,
            Arc::clone(&self.core),
            plaintext.scale(),
            plaintext.len(),
        ))
    }

    /// Encodes and encrypts `values` packed into a single ciphertext.
    pub fn encrypt_values(&self, values: &[RawValue]) -> Result<EncryptedValue> {
        let pt = self.core.codec.encode(values)?;
        self.encrypt(&pt)
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.core
    }
}
