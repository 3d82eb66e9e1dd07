// Copyright 2025 jonefeewang@gmail.com
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

pub use connection::{Http2Engine, Role, StreamWriter};
pub use flow_control::{FlowControlWindow, PendingSend, PendingSends, Progress};
pub use listener::{ControlFrame, EngineListener, EngineListenerFactory};
pub use state_machine::{apply_events, next_state, Direction, EventKind, StreamEvent, StreamState};
pub use stream::{PartialStream, Stream};

mod connection;
pub mod flow_control;
mod inbound;
mod listener;
pub mod state_machine;
mod stream;
