#![warn(
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    clippy::all,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_panics_doc
)]

//! A one-loop-per-thread TCP reactor for Linux.
//!
//! An [`EventLoop`] owns a poller, a `timerfd` timer queue and an
//! `eventfd` wakeup, and is permanently bound to the thread that created
//! it. [`TcpServer`] accepts on one loop and deals connections across an
//! [`EventLoopThreadPool`]; each [`tcp_connection::TcpConnection`] then
//! lives entirely on its assigned loop.
//!
//! Cross-thread interaction always goes through
//! [`EventLoop::run_in_loop`]; everything else is loop-affine and guarded
//! by runtime asserts.

pub mod log;

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod current_thread;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
mod poller;
pub mod sockets;
pub mod tcp_connection;
pub mod tcp_server;
mod timer_queue;

pub use buffer::Buffer;
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use muxio_timer::{Timestamp, TimerId};
pub use tcp_connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use tcp_server::TcpServer;
