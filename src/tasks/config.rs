use serde_json::{Map, Value};

use super::types::{ContainerConfig, PersistentVolume, TaskSettings, ValidationError};

/// Longest pool check interval, one year in seconds.
pub const MAX_TTL_INTERVAL: u64 = 365 * 24 * 60 * 60;

/// Parses a template's container configuration, rejecting anything that
/// could not be turned into a job or a pool pod.
pub fn parse_container_config(raw: &str) -> Result<ContainerConfig, ValidationError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::NotJson(e.to_string()))?;
    let root = value.as_object().ok_or(ValidationError::NotObject)?;

    let volume = match root.get("persistent_volume") {
        None => return Err(ValidationError::MissingField("persistent_volume")),
        Some(Value::Object(volume)) => volume,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "persistent_volume",
                expected: "an object",
            });
        }
    };

    let memory_limit = match root.get("memory_limit") {
        None => return Err(ValidationError::MissingField("memory_limit")),
        Some(Value::Null) => None,
        Some(Value::String(limit)) if limit.trim().is_empty() => None,
        Some(Value::String(limit)) => Some(limit.clone()),
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "memory_limit",
                expected: "a string",
            });
        }
    };

    let commands = match root.get("commands") {
        None => return Err(ValidationError::MissingField("commands")),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(ValidationError::WrongType {
                        field: "commands",
                        expected: "a list of strings",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "commands",
                expected: "a list of strings",
            });
        }
    };

    Ok(ContainerConfig {
        image: required_str(root, "image", "image")?,
        persistent_volume: PersistentVolume {
            name: required_str(volume, "name", "persistent_volume.name")?,
            mount_path: required_str(volume, "mount_path", "persistent_volume.mount_path")?,
        },
        working_path: required_str(root, "working_path", "working_path")?,
        shell: required_str(root, "shell", "shell")?,
        memory_limit,
        commands,
    })
}

pub fn is_valid_config(raw: &str) -> bool {
    parse_container_config(raw).is_ok()
}

/// Checks everything a template's pool schedule depends on: the container
/// config, a bounded interval and room for at least one user per pod.
pub fn validate_settings(settings: &TaskSettings) -> Result<ContainerConfig, ValidationError> {
    let container = parse_container_config(&settings.container_config)?;
    if settings.ttl_interval == 0 || settings.ttl_interval > MAX_TTL_INTERVAL {
        return Err(ValidationError::IntervalOutOfRange(settings.ttl_interval));
    }
    if settings.max_sharing_users == 0 {
        return Err(ValidationError::NoSharing);
    }
    Ok(container)
}

fn required_str(
    object: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.get(key) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}
