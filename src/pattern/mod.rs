//! Predefined interaction patterns.
//!
//! An interaction pattern describes how many request and response items are
//! exchanged in a call. Each module contains the caller side driver, an
//! inherent method on [`Connection`](crate::Connection), and the handler
//! side driver used by [`RpcServer`](crate::RpcServer).
//!
//! | pattern | requests | responses |
//! |---|---|---|
//! | unary | 1 | 1 |
//! | server streaming | 1 | stream |
//! | client streaming | stream | 1 |
//! | bidi streaming | stream | stream |
//!
//! Requests of a streaming call are sent through a
//! [`RequestSink`](crate::RequestSink). Closing the sink is the explicit end
//! of the requests. Responses of a streaming call arrive on a
//! [`ResponseStream`](crate::ResponseStream).
pub(crate) mod bidi_streaming;
pub(crate) mod client_streaming;
pub(crate) mod server_streaming;
pub(crate) mod unary;
