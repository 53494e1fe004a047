//
// Copyright 2026 Moltz Project. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Transport layer: address resolution and connection establishment.

pub mod error;
pub mod establish;
pub mod resolver;

pub use error::TransportError;
pub use establish::{Established, EstablishTimeouts, RawTransport, establish};
pub use resolver::{
    Candidate, CandidateSource, ResolveInputs, TransportMode, env_hint, resolve, upgrade_scheme,
};
