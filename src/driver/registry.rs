use thiserror::Error;

use crate::proto::status::StatusCode;
use crate::proto::wire::{LinkEntry, MAX_PORT_LINKS, MAX_SERIAL_PORTS};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("all {MAX_SERIAL_PORTS} port slots in use")]
    PortCapacity,
    #[error("all {MAX_PORT_LINKS} link slots in use")]
    LinkCapacity,
    #[error("port {0} not found")]
    PortNotFound(u8),
    #[error("no link between {0} and {1}")]
    LinkNotFound(u8, u8),
    #[error("ports {0} and {1} are already linked")]
    AlreadyLinked(u8, u8),
    #[error("port {0} cannot be linked to itself")]
    SelfLink(u8),
    #[error("port {0} is still linked")]
    PortLinked(u8),
}

impl RegistryError {
    pub fn code(&self) -> StatusCode {
        match self {
            RegistryError::PortCapacity | RegistryError::LinkCapacity => {
                StatusCode::CapacityExceeded
            }
            RegistryError::PortNotFound(_) | RegistryError::LinkNotFound(..) => {
                StatusCode::NotFound
            }
            RegistryError::AlreadyLinked(..) => StatusCode::AlreadyLinked,
            RegistryError::SelfLink(_) => StatusCode::BadArgument,
            RegistryError::PortLinked(_) => StatusCode::PortBusy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub id: u8,
    /// Trace and check bits.
    pub flags: u64,
    pub name: String,
}

/// Unordered pair of linked ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    source: u8,
    target: u8,
}

impl Link {
    fn joins(&self, a: u8, b: u8) -> bool {
        (self.source == a && self.target == b) || (self.source == b && self.target == a)
    }
    fn touches(&self, id: u8) -> bool {
        self.source == id || self.target == id
    }
}

/// Bookkeeping of which virtual ports exist and how they are linked. Slots
/// are fixed so ids stay valid indices into the wire lists.
#[derive(Debug)]
pub struct PortRegistry {
    ports: [Option<PortEntry>; MAX_SERIAL_PORTS],
    links: [Option<Link>; MAX_PORT_LINKS],
    name_prefix: String,
}

impl PortRegistry {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            ports: std::array::from_fn(|_| None),
            links: [None; MAX_PORT_LINKS],
            name_prefix: name_prefix.into(),
        }
    }

    /// Claims the lowest free slot and returns its id.
    pub fn create_port(&mut self) -> Result<u8, RegistryError> {
        let slot = self
            .ports
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::PortCapacity)?;
        let id = slot as u8;
        self.ports[slot] = Some(PortEntry {
            id,
            flags: 0,
            name: format!("{}{}", self.name_prefix, id),
        });
        Ok(id)
    }

    /// Removes a port that takes part in no link.
    pub fn remove_port(&mut self, id: u8) -> Result<PortEntry, RegistryError> {
        self.get(id).ok_or(RegistryError::PortNotFound(id))?;
        if self.links.iter().flatten().any(|l| l.touches(id)) {
            return Err(RegistryError::PortLinked(id));
        }
        self.ports[id as usize]
            .take()
            .ok_or(RegistryError::PortNotFound(id))
    }

    /// Links two distinct existing ports and returns the link slot.
    pub fn link_ports(&mut self, a: u8, b: u8) -> Result<u8, RegistryError> {
        if a == b {
            return Err(RegistryError::SelfLink(a));
        }
        for id in [a, b] {
            self.get(id).ok_or(RegistryError::PortNotFound(id))?;
        }
        if self.links.iter().flatten().any(|l| l.joins(a, b)) {
            return Err(RegistryError::AlreadyLinked(a, b));
        }
        let slot = self
            .links
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::LinkCapacity)?;
        self.links[slot] = Some(Link {
            source: a,
            target: b,
        });
        Ok(slot as u8)
    }

    /// Removes the link between `a` and `b`, in either order.
    pub fn unlink_ports(&mut self, a: u8, b: u8) -> Result<(), RegistryError> {
        let slot = self
            .links
            .iter()
            .position(|l| l.is_some_and(|l| l.joins(a, b)))
            .ok_or(RegistryError::LinkNotFound(a, b))?;
        self.links[slot] = None;
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<&PortEntry> {
        self.ports.get(id as usize).and_then(Option::as_ref)
    }

    pub fn list_ports(&self) -> Vec<PortEntry> {
        self.ports.iter().flatten().cloned().collect()
    }

    pub fn list_links(&self) -> Vec<LinkEntry> {
        self.links
            .iter()
            .enumerate()
            .filter_map(|(slot, l)| {
                l.map(|l| LinkEntry {
                    slot: slot as u8,
                    source: l.source,
                    target: l.target,
                })
            })
            .collect()
    }

    /// Ports linked to `id`.
    pub fn peers(&self, id: u8) -> Vec<u8> {
        self.links
            .iter()
            .flatten()
            .filter(|l| l.touches(id))
            .map(|l| if l.source == id { l.target } else { l.source })
            .collect()
    }

    /// Sets (`on`) or clears the bits of `mask` on a port; returns the new flags.
    pub fn set_flags(&mut self, id: u8, mask: u64, on: bool) -> Result<u64, RegistryError> {
        let entry = self
            .ports
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(RegistryError::PortNotFound(id))?;
        if on {
            entry.flags |= mask;
        } else {
            entry.flags &= !mask;
        }
        Ok(entry.flags)
    }

    pub fn port_count(&self) -> usize {
        self.ports.iter().flatten().count()
    }

    pub fn link_count(&self) -> usize {
        self.links.iter().flatten().count()
    }

    /// Drops every link and port, returning the removed port ids.
    pub fn clear(&mut self) -> Vec<u8> {
        self.links = [None; MAX_PORT_LINKS];
        self.ports
            .iter_mut()
            .filter_map(|p| p.take().map(|p| p.id))
            .collect()
    }
}
