//! Message-queuing wire-protocol client with channel multiplexing.
//!
//! mqwire multiplexes one TCP connection into independent channels, with
//! one reader thread per connection and one dispatcher thread per channel
//! so consumer callbacks can never block frame reading.
//!
//! # Crate Structure
//!
//! - [`transport`] -- Blocking TCP stream abstraction
//! - [`frame`] -- Wire framing and the method/content codec
//! - [`client`] -- Connections, channels, consumers (behind the `client`
//!   feature, on by default)

/// Re-export transport types.
pub mod transport {
    pub use mqwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use mqwire_frame::*;
}

/// Re-export client types (requires the `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use mqwire_client::*;
}
