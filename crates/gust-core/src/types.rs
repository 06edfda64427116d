use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Compose roll/pitch/yaw (radians) into a unit quaternion
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll / 2.0).sin_cos();
        let (sp, cp) = (pitch / 2.0).sin_cos();
        let (sy, cy) = (yaw / 2.0).sin_cos();

        Self {
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
            w: cr * cp * cy + sr * sp * sy,
        }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }
}

/// Camera pose published with every state update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position,
    pub rotation: Quaternion,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Position {
                x: 0.0,
                y: 3.0,
                z: 0.0,
            },
            rotation: Quaternion::IDENTITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub object_type: String,
    pub color: String,
    pub position: Position,
    pub rotation: Quaternion,
}

/// State-update document a simulated camera publishes each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub object_id: String,
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp_us: u64,
    pub data: StateData,
}

impl StateUpdate {
    pub fn camera(object_id: &str, color: &str, pose: &Pose, timestamp_us: u64) -> Self {
        Self {
            object_id: object_id.to_string(),
            action: "update".to_string(),
            kind: "object".to_string(),
            timestamp_us,
            data: StateData {
                object_type: "camera".to_string(),
                color: color.to_string(),
                position: pose.position,
                rotation: pose.rotation,
            },
        }
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The topic space is shared, so anything undecodable is simply not ours.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// CPU/memory sample published by the external system probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub cpu: f64,
    pub mem: f64,
}

impl SystemSample {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
