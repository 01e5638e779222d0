// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! JSON configuration with a typed property registry. The recognized keys
//! and their types are fixed at compile time; typed getters return a default
//! and log when the stored value does not match the registered type.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::Result;
use std::path::Path;

use serde_json::Value;

/// Environment variable naming the JSON config file.
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

pub const DEFAULT_RPC_PORT: u16 = 56039;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    U32,
    U64,
    Bool,
    Str,
    StrList,
    F64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    Str(String),
    StrList(Vec<String>),
    F64(f64),
}

/// The full key registry. Keys absent from the file fall back to defaults.
pub const PROPERTY_KEYS: &[(&str, DataType)] = &[
    ("falcon_log_dir", DataType::Str),
    ("falcon_log_level", DataType::Str),
    ("falcon_log_max_size_mb", DataType::U32),
    ("falcon_log_reserved_num", DataType::U32),
    ("falcon_log_reserved_time", DataType::U32),
    ("falcon_thread_num", DataType::U32),
    ("falcon_node_id", DataType::U32),
    ("falcon_cache_root", DataType::Str),
    ("falcon_dir_num", DataType::U32),
    ("falcon_block_size", DataType::U32),
    ("falcon_read_big_file_size", DataType::U32),
    ("falcon_preblock_num", DataType::U32),
    ("falcon_cluster_view", DataType::StrList),
    ("falcon_server_ip", DataType::Str),
    ("falcon_server_port", DataType::Str),
    ("falcon_async", DataType::Bool),
    ("falcon_persist", DataType::Bool),
    ("falcon_to_local", DataType::Bool),
    ("falcon_is_inference", DataType::Bool),
    ("falcon_eviction", DataType::F64),
    ("falcon_mount_path", DataType::Str),
    ("falcon_stat", DataType::Bool),
    ("falcon_stat_max", DataType::Bool),
    ("falcon_use_prometheus", DataType::Bool),
    ("falcon_prometheus_port", DataType::Str),
];

#[derive(Default)]
pub struct FalconConfig {
    properties: HashMap<String, PropertyValue>,
}

fn registered_type(key: &str) -> Option<DataType> {
    PROPERTY_KEYS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, ty)| *ty)
}

fn convert(value: &Value, ty: DataType) -> Option<PropertyValue> {
    match ty {
        DataType::U32 => value.as_u64().map(|v| PropertyValue::U32(v as u32)),
        DataType::U64 => value.as_u64().map(PropertyValue::U64),
        DataType::Bool => value.as_bool().map(PropertyValue::Bool),
        DataType::Str => value.as_str().map(|v| PropertyValue::Str(v.to_string())),
        DataType::F64 => value.as_f64().map(PropertyValue::F64),
        DataType::StrList => value.as_array().map(|arr| {
            PropertyValue::StrList(
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            )
        }),
    }
}

impl FalconConfig {
    /// Load the file named by `CONFIG_FILE`.
    pub fn from_env() -> Result<Self> {
        let path = env::var(CONFIG_FILE_ENV)
            .map_err(|_| einval!("CONFIG_FILE is not set"))?;
        Self::from_file(&path)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| einval!(format!("open config {:?}: {}", path.as_ref(), e)))?;
        let root: Value = serde_json::from_reader(file)
            .map_err(|e| einval!(format!("parse config {:?}: {}", path.as_ref(), e)))?;
        Self::from_value(&root)
    }

    /// Recognized keys come either from the top level or from the legacy
    /// `main` / `runtime` sections.
    pub fn from_value(root: &Value) -> Result<Self> {
        let mut flat: HashMap<&str, &Value> = HashMap::new();
        for section in ["main", "runtime"] {
            if let Some(map) = root.get(section).and_then(Value::as_object) {
                for (k, v) in map {
                    flat.insert(k.as_str(), v);
                }
            }
        }
        if let Some(map) = root.as_object() {
            for (k, v) in map {
                if registered_type(k).is_some() {
                    flat.insert(k.as_str(), v);
                }
            }
        }

        let mut properties = HashMap::new();
        for (key, ty) in PROPERTY_KEYS {
            match flat.get(key) {
                Some(raw) => match convert(raw, *ty) {
                    Some(v) => {
                        properties.insert(key.to_string(), v);
                    }
                    None => {
                        return Err(einval!(format!(
                            "config key {} should be of type {:?}",
                            key, ty
                        )));
                    }
                },
                None => {
                    warn!("config key {} not present, using default", key);
                }
            }
        }
        Ok(FalconConfig { properties })
    }

    pub fn get_u32(&self, key: &str) -> u32 {
        match self.properties.get(key) {
            Some(PropertyValue::U32(v)) => *v,
            _ => {
                warn!("u32 property {} missing or mistyped, using 0", key);
                0
            }
        }
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        match self.properties.get(key) {
            Some(PropertyValue::U64(v)) => *v,
            _ => {
                warn!("u64 property {} missing or mistyped, using 0", key);
                0
            }
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.properties.get(key) {
            Some(PropertyValue::Bool(v)) => *v,
            _ => {
                warn!("bool property {} missing or mistyped, using false", key);
                false
            }
        }
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.properties.get(key) {
            Some(PropertyValue::Str(v)) => v.clone(),
            _ => {
                warn!("string property {} missing or mistyped, using \"\"", key);
                String::new()
            }
        }
    }

    pub fn get_array(&self, key: &str) -> Vec<String> {
        match self.properties.get(key) {
            Some(PropertyValue::StrList(v)) => v.clone(),
            _ => {
                warn!("array property {} missing or mistyped, using []", key);
                Vec::new()
            }
        }
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        match self.properties.get(key) {
            Some(PropertyValue::F64(v)) => *v,
            _ => {
                warn!("f64 property {} missing or mistyped, using 0.0", key);
                0.0
            }
        }
    }
}

/// `STORAGE_THRESHOLD`, defaulting to 0.8 with persistence and 1.0 without.
pub fn storage_threshold(persist: bool) -> f64 {
    let default = if persist { 0.8 } else { 1.0 };
    match env::var("STORAGE_THRESHOLD") {
        Ok(v) => v.parse::<f64>().unwrap_or_else(|_| {
            warn!("STORAGE_THRESHOLD {:?} is not a float, using {}", v, default);
            default
        }),
        Err(_) => default,
    }
}

/// `PARENT_PATH_LEVEL`; -1 means "immediate parent".
pub fn parent_path_level() -> i32 {
    match env::var("PARENT_PATH_LEVEL") {
        Ok(v) => v.parse::<i32>().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// The advertised peer endpoint, from `POD_IP` and `BRPC_PORT`.
pub fn pod_endpoint() -> Option<String> {
    let ip = env::var("POD_IP").ok()?;
    let port = env::var("BRPC_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_RPC_PORT);
    Some(format!("{}:{}", ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> FalconConfig {
        let root = json!({
            "main": {
                "falcon_cache_root": "/tmp/falcon_cache",
                "falcon_dir_num": 100,
                "falcon_block_size": 1048576,
                "falcon_read_big_file_size": 4194304,
                "falcon_cluster_view": ["127.0.0.1:56039", "127.0.0.1:56040"],
                "falcon_persist": true,
                "falcon_eviction": 0.3
            },
            "runtime": {
                "falcon_thread_num": 8
            }
        });
        FalconConfig::from_value(&root).unwrap()
    }

    #[test]
    fn test_typed_getters() {
        let config = sample();
        assert_eq!(config.get_string("falcon_cache_root"), "/tmp/falcon_cache");
        assert_eq!(config.get_u32("falcon_dir_num"), 100);
        assert_eq!(config.get_u32("falcon_block_size"), 1 << 20);
        assert!(config.get_bool("falcon_persist"));
        assert_eq!(
            config.get_array("falcon_cluster_view"),
            vec!["127.0.0.1:56039".to_string(), "127.0.0.1:56040".to_string()]
        );
        assert!((config.get_f64("falcon_eviction") - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_key_defaults() {
        let config = sample();
        assert_eq!(config.get_u32("falcon_preblock_num"), 0);
        assert_eq!(config.get_string("falcon_mount_path"), "");
        assert!(!config.get_bool("falcon_to_local"));
    }

    #[test]
    fn test_mistyped_key_is_rejected() {
        let root = json!({ "falcon_dir_num": "not-a-number" });
        assert!(FalconConfig::from_value(&root).is_err());
    }

    #[test]
    fn test_flat_layout() {
        let root = json!({ "falcon_node_id": 2 });
        let config = FalconConfig::from_value(&root).unwrap();
        assert_eq!(config.get_u32("falcon_node_id"), 2);
    }
}
