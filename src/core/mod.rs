//! The session-coordination core: registry, session entity, activity and
//! playback state machines, idle sweeping, remote control, and the
//! authentication/token lifecycle built on top of them. Everything here
//! talks to the outside world only through the collaborator traits in
//! [`collaborators`].

pub mod auth;
pub mod collaborators;
pub mod controller;
pub mod errors;
pub mod events;
pub mod idle;
pub mod manager;
pub mod playback;
pub mod registry;
pub mod remote;
pub mod session;

pub use auth::{AuthenticationRequest, AuthenticationResult};
pub use collaborators::Collaborators;
pub use controller::{ControllerFactory, ControllerFactoryChain, SessionController};
pub use errors::{SessionError, SessionResult};
pub use events::{Event, EventBus};
pub use manager::{SessionManager, SessionManagerConfig};
pub use playback::{PlaybackProgressInfo, PlaybackStartInfo, PlaybackStopInfo};
pub use registry::SessionRegistry;
pub use remote::{BrowseRequest, MessageRequest, PlayRequest, RandomSource};
pub use session::{NowPlayingItem, PlayState, Session};
