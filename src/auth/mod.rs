// Authentication module
// Session credentials, their persistence, and the token endpoints

mod refresh;
mod session;
mod store;
mod types;

pub use refresh::{
    obtain_token_pair, refresh_access_token, user_agent, LOGIN_PATH, REFRESH_PATH,
};
pub use session::{bearer, SessionContext};
pub use store::{CredentialStore, MemoryStore, SqliteStore};
pub use types::{redact, CredentialKind, RefreshResponse, SessionEvent, TokenPair};
