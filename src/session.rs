//! Build/session context handed to the core by credential resolution.
//!
//! The core never resolves credentials itself; it reads what the
//! environment (or the embedding adapter) provides and exposes it to the
//! uploader and the ordering client through one shared [`Session`].

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::transport::Auth;

pub const ENV_JWT: &str = "TESTLENS_JWT";
pub const ENV_BUILD_HASHED_ID: &str = "TESTLENS_BUILD_HASHED_ID";
pub const ENV_BUILD_COMPLETED: &str = "TESTLENS_BUILD_COMPLETED";
pub const ENV_ORCHESTRATION_TOKEN: &str = "TESTLENS_ORCHESTRATION_TOKEN";

/// Shared session state.
///
/// Created once at startup and passed by `Arc`. The build flag and tokens may
/// be updated later (e.g. once a remote build is confirmed), so they live
/// behind interior mutability.
#[derive(Debug, Default)]
pub struct Session {
    build_confirmed: AtomicBool,
    jwt: RwLock<Option<String>>,
    build_hashed_id: RwLock<Option<String>>,
    orchestration_token: RwLock<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the session context from `TESTLENS_*` environment variables.
    pub fn from_env() -> Self {
        let session = Self::new();
        session.set_jwt(non_empty_env(ENV_JWT));
        session.set_build_hashed_id(non_empty_env(ENV_BUILD_HASHED_ID));
        session.set_orchestration_token(non_empty_env(ENV_ORCHESTRATION_TOKEN));
        session.set_build_confirmed(
            non_empty_env(ENV_BUILD_COMPLETED)
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        );
        session
    }

    pub fn with_build_confirmed(self, confirmed: bool) -> Self {
        self.set_build_confirmed(confirmed);
        self
    }

    pub fn with_jwt(self, jwt: impl Into<String>) -> Self {
        self.set_jwt(Some(jwt.into()));
        self
    }

    pub fn with_orchestration_token(self, token: impl Into<String>) -> Self {
        self.set_orchestration_token(Some(token.into()));
        self
    }

    pub fn with_build_hashed_id(self, id: impl Into<String>) -> Self {
        self.set_build_hashed_id(Some(id.into()));
        self
    }

    pub fn build_confirmed(&self) -> bool {
        self.build_confirmed.load(Ordering::Acquire)
    }

    pub fn set_build_confirmed(&self, confirmed: bool) {
        self.build_confirmed.store(confirmed, Ordering::Release);
    }

    pub fn jwt(&self) -> Option<String> {
        read(&self.jwt)
    }

    pub fn set_jwt(&self, jwt: Option<String>) {
        write(&self.jwt, jwt);
    }

    pub fn build_hashed_id(&self) -> Option<String> {
        read(&self.build_hashed_id)
    }

    pub fn set_build_hashed_id(&self, id: Option<String>) {
        write(&self.build_hashed_id, id);
    }

    pub fn orchestration_token(&self) -> Option<String> {
        read(&self.orchestration_token)
    }

    pub fn set_orchestration_token(&self, token: Option<String>) {
        write(&self.orchestration_token, token);
    }

    /// Bearer auth for the collector, if a token is present.
    pub fn telemetry_auth(&self) -> Option<Auth> {
        self.jwt().map(Auth::Bearer)
    }
}

fn read(lock: &RwLock<Option<String>>) -> Option<String> {
    lock.read().ok().and_then(|guard| guard.clone())
}

fn write(lock: &RwLock<Option<String>>, value: Option<String>) {
    if let Ok(mut guard) = lock.write() {
        *guard = value.filter(|v| !v.is_empty());
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Accepts `true`/`1`/`yes` in any case.
pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}
