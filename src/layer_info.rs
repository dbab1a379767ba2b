//! Per-layer connection metadata (endpoints, ports, TLS parameters), collected in one hierarchy
//!  per composed protocol stack so that it can be queried from any pipe end of the stack.
//!
//! Layers are ordered bottom (lowest position) to top. Positions are floating point keys so that
//!  a record can always be installed between two existing ones.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use ordered_float::OrderedFloat;
use tracing::trace;
use crate::util::merge_cell::{Absorb, MergeCell};

pub trait LayerInfo: Any + Debug + Send + Sync {
    fn layer_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IpLayerInfo {
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
}
impl LayerInfo for IpLayerInfo {
    fn layer_name(&self) -> &'static str {
        "ip"
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TcpLayerInfo {
    pub local_port: u16,
    pub remote_port: u16,
}
impl LayerInfo for TcpLayerInfo {
    fn layer_name(&self) -> &'static str {
        "tcp"
    }
}

impl TcpLayerInfo {
    /// The IP and TCP records describing a connected socket
    pub fn for_socket(local: SocketAddr, remote: SocketAddr) -> (IpLayerInfo, TcpLayerInfo) {
        (
            IpLayerInfo { local_ip: local.ip(), remote_ip: remote.ip() },
            TcpLayerInfo { local_port: local.port(), remote_port: remote.port() },
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TlsLayerInfo {
    pub is_server: bool,
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub server_name: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
}
impl LayerInfo for TlsLayerInfo {
    fn layer_name(&self) -> &'static str {
        "tls"
    }
}

/// Identifies an installed record, unique across all hierarchies so that merged hierarchies
///  never see colliding ids
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LayerId(u64);

impl LayerId {
    fn next() -> LayerId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        LayerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LayerPosition {
    Top,
    Bottom,
    Above(LayerId),
    Below(LayerId),
}

type PositionKey = (OrderedFloat<f64>, LayerId);

#[derive(Debug, Clone)]
struct Entry {
    info: Arc<dyn LayerInfo>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Debug, Default)]
struct LayerTree {
    entries: BTreeMap<PositionKey, Entry>,
}

impl LayerTree {
    fn key_of(&self, id: LayerId) -> Option<PositionKey> {
        self.entries.keys()
            .find(|(_, i)| *i == id)
            .cloned()
    }

    fn min_pos(&self) -> Option<f64> {
        self.entries.keys().next().map(|(p, _)| p.0)
    }

    fn max_pos(&self) -> Option<f64> {
        self.entries.keys().next_back().map(|(p, _)| p.0)
    }

    fn position_for(&self, position: LayerPosition) -> f64 {
        let anchor = match position {
            LayerPosition::Above(id) | LayerPosition::Below(id) => self.key_of(id),
            _ => None,
        };

        match (position, anchor) {
            (LayerPosition::Above(_), Some(key)) => {
                match self.entries.range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded)).next() {
                    Some(((next, _), _)) if next.0 > key.0.0 => (key.0.0 + next.0) / 2.0,
                    Some(((next, _), _)) => next.0,
                    None => key.0.0 + 1.0,
                }
            }
            (LayerPosition::Below(_), Some(key)) => {
                match self.entries.range(..key).next_back() {
                    Some(((prev, _), _)) if prev.0 < key.0.0 => (key.0.0 + prev.0) / 2.0,
                    Some(((prev, _), _)) => prev.0,
                    None => key.0.0 - 1.0,
                }
            }
            (LayerPosition::Bottom, _) => self.min_pos().map(|p| p - 1.0).unwrap_or(0.0),
            // 'Top', and anchors that are not (or no longer) installed
            _ => self.max_pos().map(|p| p + 1.0).unwrap_or(0.0),
        }
    }
}

impl Absorb for LayerTree {
    /// The absorbed entries are placed below the surviving ones, keeping their relative order:
    ///  hierarchies are merged upper-absorbs-lower when layers are stacked.
    fn absorb(&mut self, other: Self) {
        let (Some(other_max), Some(self_min)) = (other.max_pos(), self.min_pos()) else {
            self.entries.extend(other.entries);
            return;
        };

        let shift = (self_min - 1.0) - other_max;
        for ((pos, id), entry) in other.entries {
            self.entries.insert((OrderedFloat(pos.0 + shift), id), entry);
        }
    }
}

/// Shared, internally synchronized hierarchy of [LayerInfo] records. Clones refer to the same
///  hierarchy, and so do hierarchies that were merged via `encounter`.
#[derive(Clone, Debug)]
pub struct LayerInfoHierarchy {
    cell: Arc<MergeCell<LayerTree>>,
}

impl Default for LayerInfoHierarchy {
    fn default() -> Self {
        LayerInfoHierarchy::new()
    }
}

impl LayerInfoHierarchy {
    pub fn new() -> LayerInfoHierarchy {
        LayerInfoHierarchy {
            cell: MergeCell::new(LayerTree::default()),
        }
    }

    pub fn install<T: LayerInfo>(&self, info: T, position: LayerPosition) -> LayerId {
        let info = Arc::new(info);
        let id = LayerId::next();
        self.cell.with(|tree| {
            let pos = tree.position_for(position);
            trace!(layer = info.layer_name(), ?id, pos, "installing layer info");
            tree.entries.insert((OrderedFloat(pos), id), Entry {
                info: info.clone(),
                any: info,
            });
        });
        id
    }

    pub fn uninstall(&self, id: LayerId) -> bool {
        self.cell.with(|tree| {
            match tree.key_of(id) {
                Some(key) => tree.entries.remove(&key).is_some(),
                None => false,
            }
        })
    }

    /// All records of type `T`, bottom to top
    pub fn get_values<T: LayerInfo>(&self) -> Vec<Arc<T>> {
        self.cell.with(|tree| {
            tree.entries.values()
                .filter_map(|e| e.any.clone().downcast::<T>().ok())
                .collect()
        })
    }

    /// The `index`-th record of type `T`, counting from the bottom
    pub fn get_value<T: LayerInfo>(&self, index: usize) -> Option<Arc<T>> {
        self.get_values::<T>().into_iter().nth(index)
    }

    /// Names of all installed layers, bottom to top
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.cell.with(|tree| tree.entries.values().map(|e| e.info.layer_name()).collect())
    }

    pub fn len(&self) -> usize {
        self.cell.with(|tree| tree.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge `lower` into this hierarchy. All of `lower`'s records end up below this hierarchy's
    ///  records, and both handles refer to the merged hierarchy afterwards.
    pub fn encounter(&self, lower: &LayerInfoHierarchy) {
        self.cell.merge(&lower.cell);
    }

    pub fn is_same(&self, other: &LayerInfoHierarchy) -> bool {
        self.cell.is_same(&other.cell)
    }
}
