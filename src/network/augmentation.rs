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

//! Augmentations are interceptors bound to a connection or a server.
//!
//! Every send and every receive runs the chain in two passes: a transform
//! pass where each `before_*` hook gets the previous hook's output, then an
//! observe pass where each `after_*` hook sees the final value. Both passes
//! and both directions use insertion order.
//!
//! Hooks run inline on whatever task performs the I/O, so they must not
//! block.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::service::{MultiClientServer, TcpServer};

use super::{Connection, TextEncoding};

/// Kind of the object an augmentation is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Connection,
    SingleClientServer,
    MultiClientServer,
}

/// What an augmentation is being installed on, started with or stopped with.
#[derive(Clone, Copy)]
pub enum AugmentationHost<'a> {
    Connection(&'a Connection),
    TcpServer(&'a TcpServer),
    MultiClientServer(&'a MultiClientServer),
}

impl AugmentationHost<'_> {
    pub fn kind(&self) -> HostKind {
        match self {
            AugmentationHost::Connection(_) => HostKind::Connection,
            AugmentationHost::TcpServer(_) => HostKind::SingleClientServer,
            AugmentationHost::MultiClientServer(_) => HostKind::MultiClientServer,
        }
    }

    pub fn is_multi_client(&self) -> bool {
        self.kind() == HostKind::MultiClientServer
    }

    pub fn connection(&self) -> Option<&Connection> {
        match self {
            AugmentationHost::Connection(connection) => Some(connection),
            _ => None,
        }
    }
}

impl fmt::Debug for AugmentationHost<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AugmentationHost::Connection(c) => write!(f, "Connection({})", c.id()),
            AugmentationHost::TcpServer(_) => write!(f, "TcpServer"),
            AugmentationHost::MultiClientServer(_) => write!(f, "MultiClientServer"),
        }
    }
}

/// An installable interceptor. Every hook has a pass-through default.
pub trait Augmentation: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn before_send_bytes(&self, data: Bytes) -> Bytes {
        data
    }

    fn after_send_bytes(&self, _data: &[u8]) {}

    fn before_send_line(&self, line: String, _encoding: TextEncoding) -> String {
        line
    }

    fn after_send_line(&self, _line: &str, _encoding: TextEncoding) {}

    fn before_receive_bytes(&self, data: Bytes) -> Bytes {
        data
    }

    fn after_receive_bytes(&self, _data: &[u8]) {}

    fn before_receive_line(&self, line: String, _encoding: TextEncoding) -> String {
        line
    }

    fn after_receive_line(&self, _line: &str, _encoding: TextEncoding) {}

    fn on_start(&self, _host: AugmentationHost<'_>) {}

    fn on_stop(&self, _host: AugmentationHost<'_>) {}

    fn on_installed(&self, _host: AugmentationHost<'_>) {}

    fn on_uninstalled(&self, _host: AugmentationHost<'_>) {}
}

fn same_augmentation(a: &Arc<dyn Augmentation>, b: &Arc<dyn Augmentation>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered set of augmentations, compared by pointer identity.
#[derive(Default)]
pub struct AugmentationChain {
    entries: RwLock<Vec<Arc<dyn Augmentation>>>,
}

impl AugmentationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `augmentation` and fires its install hook.
    ///
    /// Returns `false` without firing anything when it is already installed.
    pub fn install(&self, augmentation: Arc<dyn Augmentation>, host: AugmentationHost<'_>) -> bool {
        {
            let mut entries = self.entries.write();
            if entries.iter().any(|e| same_augmentation(e, &augmentation)) {
                return false;
            }
            entries.push(augmentation.clone());
        }
        debug!("augmentation {} installed on {:?}", augmentation.name(), host);
        augmentation.on_installed(host);
        true
    }

    /// Removes `augmentation` and fires its uninstall hook.
    pub fn uninstall(&self, augmentation: &Arc<dyn Augmentation>, host: AugmentationHost<'_>) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|e| !same_augmentation(e, augmentation));
            before != entries.len()
        };
        if removed {
            debug!(
                "augmentation {} uninstalled from {:?}",
                augmentation.name(),
                host
            );
            augmentation.on_uninstalled(host);
        }
        removed
    }

    pub fn contains(&self, augmentation: &Arc<dyn Augmentation>) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| same_augmentation(e, augmentation))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Freezes the current membership for the duration of one operation.
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot(self.entries.read().clone())
    }

    pub fn notify_start(&self, host: AugmentationHost<'_>) {
        for augmentation in self.snapshot().0 {
            augmentation.on_start(host);
        }
    }

    pub fn notify_stop(&self, host: AugmentationHost<'_>) {
        for augmentation in self.snapshot().0 {
            augmentation.on_stop(host);
        }
    }
}

impl fmt::Debug for AugmentationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_list()
            .entries(entries.iter().map(|e| e.name().to_string()))
            .finish()
    }
}

/// The chain as it was when an operation began.
pub struct ChainSnapshot(Vec<Arc<dyn Augmentation>>);

impl ChainSnapshot {
    pub fn before_send_bytes(&self, data: Bytes) -> Bytes {
        self.0.iter().fold(data, |data, a| a.before_send_bytes(data))
    }

    pub fn after_send_bytes(&self, data: &[u8]) {
        self.0.iter().for_each(|a| a.after_send_bytes(data));
    }

    pub fn before_send_line(&self, line: String, encoding: TextEncoding) -> String {
        self.0
            .iter()
            .fold(line, |line, a| a.before_send_line(line, encoding))
    }

    pub fn after_send_line(&self, line: &str, encoding: TextEncoding) {
        self.0.iter().for_each(|a| a.after_send_line(line, encoding));
    }

    /// Inbound transform pass followed by the observe pass.
    pub fn receive_bytes(&self, data: Bytes) -> Bytes {
        let data = self
            .0
            .iter()
            .fold(data, |data, a| a.before_receive_bytes(data));
        self.0.iter().for_each(|a| a.after_receive_bytes(&data));
        data
    }

    pub fn receive_line(&self, line: String, encoding: TextEncoding) -> String {
        let line = self
            .0
            .iter()
            .fold(line, |line, a| a.before_receive_line(line, encoding));
        self.0
            .iter()
            .for_each(|a| a.after_receive_line(&line, encoding));
        line
    }
}
