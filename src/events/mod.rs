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

#![allow(missing_docs)]

pub use self::network::{
    ConnectedPeerAddr, NetworkEvent, NetworkHandler, NetworkPart, NetworkRequest,
    SharedConnectionPool,
};

pub mod codec;
pub mod error;
pub mod network;

use futures::{Stream, StreamExt};

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use crate::chain::ChainEvent;

/// Event consumed by the supervisor loop.
#[derive(Debug)]
pub enum Event {
    /// Chain subsystem notification.
    Chain(ChainEvent),
    /// Network layer event.
    Network(NetworkEvent),
}

pub trait EventHandler {
    fn handle_event(&mut self, event: Event);
}

/// Handler half of the node: feeds aggregated events into the supervisor.
pub struct HandlerPart<H: EventHandler> {
    pub handler: H,
    pub chain_rx: futures::channel::mpsc::Receiver<ChainEvent>,
    pub network_rx: futures::channel::mpsc::Receiver<NetworkEvent>,
}

impl<H: EventHandler + Send + 'static> HandlerPart<H> {
    pub async fn run(self) {
        let mut handler = self.handler;
        let mut aggregator = EventsAggregator::new(self.chain_rx, self.network_rx);
        while let Some(event) = aggregator.next().await {
            handler.handle_event(event);
        }
    }
}

/// Merges chain and network events into one stream, chain events first.
/// Once either source stream closes, the aggregator completes immediately.
#[derive(Debug)]
pub struct EventsAggregator<S1, S2> {
    done: bool,
    chain: S1,
    network: S2,
}

impl<S1, S2> EventsAggregator<S1, S2> {
    pub fn new(chain: S1, network: S2) -> Self {
        Self {
            done: false,
            chain,
            network,
        }
    }
}

impl<S1, S2> Stream for EventsAggregator<S1, S2>
where
    S1: Stream<Item = ChainEvent> + Unpin,
    S2: Stream<Item = NetworkEvent> + Unpin,
{
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.chain).poll_next(cx) {
            Poll::Ready(Some(event)) => return Poll::Ready(Some(Event::Chain(event))),
            Poll::Ready(None) => {
                this.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        match Pin::new(&mut this.network).poll_next(cx) {
            Poll::Ready(Some(event)) => return Poll::Ready(Some(Event::Network(event))),
            Poll::Ready(None) => {
                this.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use futures::{channel::mpsc, SinkExt, StreamExt};

    use super::*;
    use crate::helpers::Height;

    #[tokio::test]
    async fn chain_events_have_priority() {
        let (mut chain_tx, chain_rx) = mpsc::channel(4);
        let (mut network_tx, network_rx) = mpsc::channel(4);
        let mut aggregator = EventsAggregator::new(chain_rx, network_rx);

        network_tx
            .send(NetworkEvent::PeerDisconnected(Default::default()))
            .await
            .unwrap();
        chain_tx
            .send(ChainEvent::BlockConnected {
                height: Height(1),
                last_rotation: 10,
            })
            .await
            .unwrap();

        match aggregator.next().await {
            Some(Event::Chain(ChainEvent::BlockConnected { height, .. })) => {
                assert_eq!(height, Height(1));
            }
            other => panic!("expected chain event first, got {:?}", other),
        }
        match aggregator.next().await {
            Some(Event::Network(NetworkEvent::PeerDisconnected(_))) => {}
            other => panic!("expected network event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn aggregator_completes_when_a_stream_closes() {
        let (chain_tx, chain_rx) = mpsc::channel::<ChainEvent>(4);
        let (network_tx, network_rx) = mpsc::channel(4);
        let mut aggregator = EventsAggregator::new(chain_rx, network_rx);

        drop(chain_tx);
        assert!(aggregator.next().await.is_none());
        drop(network_tx);
    }
}
