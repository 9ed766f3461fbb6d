// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Model Context Protocol plumbing.
//!
//! `protocol` holds the JSON-RPC 2.0 / MCP wire types used on both sides of
//! the relay. `upstream` and `client` face the backends; `server` faces the
//! downstream client.

pub mod client;
pub mod protocol;
pub mod server;
pub mod upstream;

pub use client::BackendSession;
pub use protocol::*;
pub use server::{mcp_router, serve_stdio};
pub use upstream::{
    open_transport, ChannelUpstream, TransportError, TransportSpec, UpstreamTransport,
};
