// Copyright 2020 The Arbor Core Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Handling of block pull requests.
//!
//! A syncer issues a `getdata` when a consensus message references a tree it
//! has never seen. Serving the block itself is the block relay's job: block
//! payloads do not travel over the consensus wire, so the supervisor checks
//! that the block is actually known and surfaces a notification for the
//! embedding node to answer. The block re-enters consensus on the requester
//! side as a candidate-block chain event.

use log::{info, trace};

use crate::{helpers::MemberId, messages::GetData, supervisor::ConsensusSupervisor, NodeNotification};

impl ConsensusSupervisor {
    /// Handles a `getdata` received from a committee peer.
    pub(crate) fn handle_get_data(&mut self, from: MemberId, msg: GetData) {
        trace!(
            "pull request from {} for {} at {}",
            from,
            msg.tree_hash,
            msg.height
        );
        if self.chain().block_by_hash(&msg.tree_hash).is_none() {
            info!(
                "pull request from {} for unknown block {}",
                from, msg.tree_hash
            );
            return;
        }

        let notification = NodeNotification::DataRequested {
            member: from,
            height: msg.height,
            hash: msg.tree_hash,
        };
        self.notifications().try_send(notification).ok();
    }
}
