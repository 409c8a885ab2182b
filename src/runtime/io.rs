use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Bytes in one RX or TX packet.
pub const PACKET_LEN: usize = 16;

pub type Packet = [u8; PACKET_LEN];

/// A machine I/O point, addressed in code by its `IO_*` constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoPoint {
    Pressure,
    Flow,
    ShowerTemp,
    GroupMetalTemp,
    GroupInletTemp,
    Vol,
    NumSeconds,
    EndShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoAccess {
    Read,
    Write,
    ReadTarget,
}

impl std::fmt::Display for IoAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoAccess::Read => write!(f, "read"),
            IoAccess::Write => write!(f, "write"),
            IoAccess::ReadTarget => write!(f, "read-target"),
        }
    }
}

/// R/W/T flags of one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPermissions {
    pub read: bool,
    pub write: bool,
    pub read_target: bool,
}

impl IoPermissions {
    const RWT: IoPermissions = IoPermissions {
        read: true,
        write: true,
        read_target: true,
    };
    const R: IoPermissions = IoPermissions {
        read: true,
        write: false,
        read_target: false,
    };
    const W: IoPermissions = IoPermissions {
        read: false,
        write: true,
        read_target: false,
    };

    pub fn allows(&self, access: IoAccess) -> bool {
        match access {
            IoAccess::Read => self.read,
            IoAccess::Write => self.write,
            IoAccess::ReadTarget => self.read_target,
        }
    }
}

impl IoPoint {
    /// In index order; the index is the value the `IO_*` constant compiles to.
    pub const ALL: [IoPoint; 8] = [
        IoPoint::Pressure,
        IoPoint::Flow,
        IoPoint::ShowerTemp,
        IoPoint::GroupMetalTemp,
        IoPoint::GroupInletTemp,
        IoPoint::Vol,
        IoPoint::NumSeconds,
        IoPoint::EndShot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IoPoint::Pressure => "IO_Pressure",
            IoPoint::Flow => "IO_Flow",
            IoPoint::ShowerTemp => "IO_ShowerTemp",
            IoPoint::GroupMetalTemp => "IO_GroupMetalTemp",
            IoPoint::GroupInletTemp => "IO_GroupInletTemp",
            IoPoint::Vol => "IO_Vol",
            IoPoint::NumSeconds => "IO_NumSeconds",
            IoPoint::EndShot => "IO_EndShot",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: i64) -> Option<IoPoint> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn from_name(name: &str) -> Option<IoPoint> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn permissions(self) -> IoPermissions {
        match self {
            IoPoint::Vol | IoPoint::NumSeconds => IoPermissions::R,
            IoPoint::EndShot => IoPermissions::W,
            _ => IoPermissions::RWT,
        }
    }
}

impl std::fmt::Display for IoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The machine side of `IOR`, `IOW`, `IORT`, `TXP` and `RXP?`.
///
/// The VM checks point permissions before calling in, so implementations
/// only see accesses the point table allows.
pub trait DeviceBridge {
    fn read(&mut self, point: IoPoint) -> f32;

    fn write(&mut self, point: IoPoint, value: f32);

    /// The last value written to `point`.
    fn read_target(&mut self, point: IoPoint) -> f32;

    /// Returns whether the packet was accepted.
    fn transmit(&mut self, _packet: &Packet) -> bool {
        true
    }

    /// A pending inbound packet, if any.
    fn receive(&mut self) -> Option<Packet> {
        None
    }
}

/// In-process stand-in for the machine.
///
/// Actuated points settle on their target as soon as it is written, so a
/// read after a write sees the written value.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    readings: [f32; 8],
    targets: [f32; 8],
    sent: Vec<Packet>,
    inbox: VecDeque<Packet>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reading(&mut self, point: IoPoint, value: f32) {
        self.readings[point.index()] = value;
    }

    pub fn reading(&self, point: IoPoint) -> f32 {
        self.readings[point.index()]
    }

    pub fn target(&self, point: IoPoint) -> f32 {
        self.targets[point.index()]
    }

    pub fn queue_packet(&mut self, packet: Packet) {
        self.inbox.push_back(packet);
    }

    pub fn sent_packets(&self) -> &[Packet] {
        &self.sent
    }
}

impl DeviceBridge for SimulatedDevice {
    fn read(&mut self, point: IoPoint) -> f32 {
        self.readings[point.index()]
    }

    fn write(&mut self, point: IoPoint, value: f32) {
        self.targets[point.index()] = value;
        if point.permissions().read {
            self.readings[point.index()] = value;
        }
    }

    fn read_target(&mut self, point: IoPoint) -> f32 {
        self.targets[point.index()]
    }

    fn transmit(&mut self, packet: &Packet) -> bool {
        self.sent.push(*packet);
        true
    }

    fn receive(&mut self) -> Option<Packet> {
        self.inbox.pop_front()
    }
}
