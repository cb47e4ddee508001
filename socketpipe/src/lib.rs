//! socketpipe
//!
//! Socket-facing façade over `socketpipe-core`'s runtime-agnostic kernel,
//! built on `compio`:
//! - `StreamConnection` (`connection`): a TCP socket bound to two pipes
//!   via an independent receive-loop and send-loop.
//! - `FrameChannel` (`frame_channel`): a UDP socket bound to two bounded
//!   message queues via a pluggable `Marshaller`.
//! - `ClientListener` (`listener`): a TCP accept loop dispatching each
//!   client to a `StreamConnection`.
//! - Frame marshalling (`frame`) and socket option helpers
//!   (`socket_options`).
//!
//! Everything here is safe code except the raw-descriptor round trips in
//! `socket_options`, isolated the same way `socketpipe-core::segment`
//! isolates its own unsafe.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

pub mod connection;
pub mod frame;
pub mod frame_channel;
pub mod listener;
pub mod socket_options;

pub mod prelude {
    pub use crate::connection::{StreamConnection, StreamConnectionOptions};
    pub use crate::frame::{
        BytesMarshaller, CharMemoryMarshaller, Frame, Marshaller, Utf8Int32Marshaller,
        Utf8StringMarshaller,
    };
    pub use crate::frame_channel::{
        frame_channel, ChannelMode, FrameChannelOptions, FrameChannelReceiver, FrameChannelSender,
    };
    pub use crate::listener::{ClientListener, ClientListenerHandler, ListenerOptions};
    pub use crate::socket_options::{
        apply_recommended_stream_opts, bind_tcp_listener, bind_udp_socket, duplicate_stream,
        shutdown_stream,
    };

    pub use socketpipe_core::prelude::*;
}
