pub mod codec;
pub mod config;
pub mod hub;
pub mod limit;
pub mod roster;
pub mod router;
pub mod session;
pub mod transport;
pub mod username;


// Re-export the pieces front-ends actually touch.
pub use codec::{CodecError, FrameType, MAX_CONTENT, RawFrame, Reply};
pub use config::{EvictionConfig, HubConfig, PipeConfig, RateConfig};
pub use hub::{Backend, Hub};
pub use roster::{Registration, RegistrationError, Roster};
pub use router::{Emission, Router};
pub use session::{ConnectError, Endpoint, Event, Session, SessionError, SessionState};
pub use username::UserName;

/// Error returned by most functions.
///
/// The hot paths (codec, router) define their own `enum` error types because
/// those errors are hit and handled during normal operation; a boxed
/// `std::error::Error` is for the outer layers where the only remaining
/// choice is to log and give up.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for chat broker operations.
///
/// # Examples
///
/// Connecting a client over the named-pipe transport and saying hello:
///
/// ```rust,no_run
/// use chathub::session::{Endpoint, Session};
/// use std::path::PathBuf;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let endpoint = Endpoint::Pipe {
///         server_path: PathBuf::from("/tmp/chat_server_fifo"),
///         client_dir: PathBuf::from("/tmp"),
///     };
///     let mut session = Session::connect(endpoint, "alice").await?;
///
///     session.send_broadcast(b"hello everyone").await?;
///     session.send_private("bob", b"psst").await?;
///     session.request_list().await?;
///
///     if let Some(event) = session.next_event().await {
///         println!("{event:?}");
///     }
///
///     session.leave().await?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
