// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! An in-process duplex transport: two adapters joined by a pair of byte
//! pipes. This is what the integration tests run on, and it doubles as the
//! reference for how little an adapter actually has to do.

use crate::adapter::{Adapter, AdapterContext, ChannelHandle};
use crate::types::{AdapterId, ChannelKind};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

struct Link {
    left_handle: ChannelHandle,
    right_handle: ChannelHandle,
    pumps: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    left: Option<AdapterContext>,
    right: Option<AdapterContext>,
    link: Option<Link>,
}

impl Shared {
    /// Wires a fresh pair of pipes once both sides have started. Each call
    /// produces brand-new channels; channel ids are never reused.
    fn wire(&mut self) {
        let (Some(left_ctx), Some(right_ctx)) = (&self.left, &self.right) else {
            return;
        };
        if self.link.is_some() {
            return;
        }

        let (left_out_tx, mut left_out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (right_out_tx, mut right_out_rx) = mpsc::channel::<Vec<u8>>(256);

        // The left side plays the dialer and speaks first.
        let left_handle = left_ctx.add_channel(left_out_tx, true);
        let right_handle = right_ctx.add_channel(right_out_tx, false);

        let to_right = right_handle.clone();
        let left_gone = right_handle.clone();
        let pump_left = tokio::spawn(async move {
            while let Some(bytes) = left_out_rx.recv().await {
                to_right.receive(bytes);
            }
            // Left stopped writing; the right side's inbound is dead.
            left_gone.remove();
        });

        let to_left = left_handle.clone();
        let right_gone = left_handle.clone();
        let pump_right = tokio::spawn(async move {
            while let Some(bytes) = right_out_rx.recv().await {
                to_left.receive(bytes);
            }
            right_gone.remove();
        });

        left_handle.establish();
        right_handle.establish();

        self.link = Some(Link {
            left_handle,
            right_handle,
            pumps: vec![pump_left, pump_right],
        });
    }

    fn sever(&mut self) {
        if let Some(link) = self.link.take() {
            for pump in &link.pumps {
                pump.abort();
            }
            link.left_handle.remove();
            link.right_handle.remove();
        }
    }
}

/// One end of an in-process link. Create both ends with [`MemoryAdapter::pair`]
/// and attach them to two repos.
pub struct MemoryAdapter {
    adapter_id: AdapterId,
    side: Side,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryAdapter {
    /// A connected pair of adapters. The link comes up once both repos have
    /// started their end.
    pub fn pair(name: &str) -> (Arc<Self>, Arc<Self>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let left = Arc::new(Self {
            adapter_id: AdapterId::from(format!("memory-{name}-left")),
            side: Side::Left,
            shared: Arc::clone(&shared),
        });
        let right = Arc::new(Self {
            adapter_id: AdapterId::from(format!("memory-{name}-right")),
            side: Side::Right,
            shared,
        });
        (left, right)
    }

    /// Tears the link down, as if the network dropped. Both repos observe
    /// their channel being removed.
    pub fn disconnect(&self) {
        debug!(adapter = %self.adapter_id, "Severing in-process link");
        self.shared.lock().expect("memory link lock poisoned").sever();
    }

    /// Brings the link back up with fresh channels, as a reconnecting
    /// transport would.
    pub fn reconnect(&self) {
        debug!(adapter = %self.adapter_id, "Rewiring in-process link");
        self.shared.lock().expect("memory link lock poisoned").wire();
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn adapter_id(&self) -> AdapterId {
        self.adapter_id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Network
    }

    async fn start(&self, context: AdapterContext) -> Result<()> {
        let mut shared = self.shared.lock().expect("memory link lock poisoned");
        match self.side {
            Side::Left => shared.left = Some(context),
            Side::Right => shared.right = Some(context),
        }
        shared.wire();
        Ok(())
    }

    async fn stop(&self) {
        let mut shared = self.shared.lock().expect("memory link lock poisoned");
        shared.sever();
        match self.side {
            Side::Left => shared.left = None,
            Side::Right => shared.right = None,
        }
    }
}
