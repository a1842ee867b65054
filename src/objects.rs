//! Built-in definitions for the OMA standard objects the runtime needs:
//! Security (0), Server (1) and Device (3), plus the lookups the engine
//! performs against them (short server id for a peer address, bootstrap
//! flag, notification defaults).

use std::net::SocketAddr;

use crate::definition::{DefinitionRegistry, ObjectDefinition, ResourceDefinition};
use crate::store::ObjectStore;
use crate::types::{InstanceId, Operations, SECURITY_OBJECT, SERVER_OBJECT, DEVICE_OBJECT};
use crate::value::{ResourceKind, Value};

// Security object (0) resources.
pub const SECURITY_SERVER_URI: u16 = 0;
pub const SECURITY_BOOTSTRAP_SERVER: u16 = 1;
pub const SECURITY_MODE: u16 = 2;
pub const SECURITY_PUBLIC_KEY_OR_IDENTITY: u16 = 3;
pub const SECURITY_SERVER_PUBLIC_KEY: u16 = 4;
pub const SECURITY_SECRET_KEY: u16 = 5;
pub const SECURITY_SHORT_SERVER_ID: u16 = 10;
pub const SECURITY_HOLD_OFF_TIME: u16 = 11;

// Server object (1) resources.
pub const SERVER_SHORT_SERVER_ID: u16 = 0;
pub const SERVER_LIFETIME: u16 = 1;
pub const SERVER_DEFAULT_MIN_PERIOD: u16 = 2;
pub const SERVER_DEFAULT_MAX_PERIOD: u16 = 3;
pub const SERVER_NOTIFICATION_STORING: u16 = 6;
pub const SERVER_BINDING: u16 = 7;
pub const SERVER_UPDATE_TRIGGER: u16 = 8;

// Device object (3) resources.
pub const DEVICE_MANUFACTURER: u16 = 0;
pub const DEVICE_MODEL_NUMBER: u16 = 1;
pub const DEVICE_SERIAL_NUMBER: u16 = 2;
pub const DEVICE_FIRMWARE_VERSION: u16 = 3;
pub const DEVICE_REBOOT: u16 = 4;
pub const DEVICE_BATTERY_LEVEL: u16 = 9;
pub const DEVICE_ERROR_CODE: u16 = 11;
pub const DEVICE_CURRENT_TIME: u16 = 13;
pub const DEVICE_UTC_OFFSET: u16 = 14;
pub const DEVICE_TIMEZONE: u16 = 15;
pub const DEVICE_SUPPORTED_BINDINGS: u16 = 16;

/// Install the standard object set. Idempotent failure is a programming
/// error, so this panics on a duplicate registration.
pub fn register_standard_objects(registry: &mut DefinitionRegistry) {
    register_security_object(registry);
    register_server_object(registry);
    register_device_object(registry);
}

fn register_security_object(registry: &mut DefinitionRegistry) {
    registry
        .register_object(ObjectDefinition::new(SECURITY_OBJECT, "LWM2MSecurity").instances(0, 4))
        .expect("security object registers once");

    let resources = [
        (SECURITY_SERVER_URI, "ServerURI", ResourceKind::String, 1u16),
        (
            SECURITY_BOOTSTRAP_SERVER,
            "BootstrapServer",
            ResourceKind::Boolean,
            1,
        ),
        (SECURITY_MODE, "SecurityMode", ResourceKind::Integer, 1),
        (
            SECURITY_PUBLIC_KEY_OR_IDENTITY,
            "PublicKeyOrIdentity",
            ResourceKind::Opaque,
            1,
        ),
        (
            SECURITY_SERVER_PUBLIC_KEY,
            "ServerPublicKey",
            ResourceKind::Opaque,
            1,
        ),
        (SECURITY_SECRET_KEY, "SecretKey", ResourceKind::Opaque, 1),
        (
            SECURITY_SHORT_SERVER_ID,
            "ShortServerID",
            ResourceKind::Integer,
            0,
        ),
        (
            SECURITY_HOLD_OFF_TIME,
            "ClientHoldOffTime",
            ResourceKind::Integer,
            0,
        ),
    ];
    for (id, name, kind, min) in resources {
        registry
            .register_resource(
                ResourceDefinition::new(SECURITY_OBJECT, id, name, kind)
                    .instances(min, 1)
                    // The security object is never exposed to management
                    // servers; its resources carry no remote operations.
                    .operations(Operations::None),
            )
            .expect("security resources register once");
    }
}

fn register_server_object(registry: &mut DefinitionRegistry) {
    registry
        .register_object(ObjectDefinition::new(SERVER_OBJECT, "LWM2MServer").instances(0, 4))
        .expect("server object registers once");

    let resources = [
        (
            SERVER_SHORT_SERVER_ID,
            "ShortServerID",
            ResourceKind::Integer,
            1u16,
            Operations::Read,
        ),
        (
            SERVER_LIFETIME,
            "Lifetime",
            ResourceKind::Integer,
            1,
            Operations::ReadWrite,
        ),
        (
            SERVER_DEFAULT_MIN_PERIOD,
            "DefaultMinimumPeriod",
            ResourceKind::Integer,
            0,
            Operations::ReadWrite,
        ),
        (
            SERVER_DEFAULT_MAX_PERIOD,
            "DefaultMaximumPeriod",
            ResourceKind::Integer,
            0,
            Operations::ReadWrite,
        ),
        (
            SERVER_NOTIFICATION_STORING,
            "NotificationStoringWhenDisabledOrOffline",
            ResourceKind::Boolean,
            1,
            Operations::ReadWrite,
        ),
        (
            SERVER_BINDING,
            "Binding",
            ResourceKind::String,
            1,
            Operations::ReadWrite,
        ),
    ];
    for (id, name, kind, min, operations) in resources {
        registry
            .register_resource(
                ResourceDefinition::new(SERVER_OBJECT, id, name, kind)
                    .instances(min, 1)
                    .operations(operations),
            )
            .expect("server resources register once");
    }
    registry
        .register_resource(
            ResourceDefinition::new(
                SERVER_OBJECT,
                SERVER_UPDATE_TRIGGER,
                "RegistrationUpdateTrigger",
                ResourceKind::None,
            )
            .operations(Operations::Execute),
        )
        .expect("server resources register once");
}

fn register_device_object(registry: &mut DefinitionRegistry) {
    registry
        .register_object(ObjectDefinition::new(DEVICE_OBJECT, "Device").instances(1, 1))
        .expect("device object registers once");

    let strings = [
        (DEVICE_MANUFACTURER, "Manufacturer", Operations::Read),
        (DEVICE_MODEL_NUMBER, "ModelNumber", Operations::Read),
        (DEVICE_SERIAL_NUMBER, "SerialNumber", Operations::Read),
        (DEVICE_FIRMWARE_VERSION, "FirmwareVersion", Operations::Read),
        (DEVICE_UTC_OFFSET, "UTCOffset", Operations::ReadWrite),
        (DEVICE_TIMEZONE, "Timezone", Operations::ReadWrite),
    ];
    for (id, name, operations) in strings {
        registry
            .register_resource(
                ResourceDefinition::new(DEVICE_OBJECT, id, name, ResourceKind::String)
                    .operations(operations),
            )
            .expect("device resources register once");
    }

    registry
        .register_resource(
            ResourceDefinition::new(DEVICE_OBJECT, DEVICE_REBOOT, "Reboot", ResourceKind::None)
                .operations(Operations::Execute),
        )
        .expect("device resources register once");
    registry
        .register_resource(
            ResourceDefinition::new(
                DEVICE_OBJECT,
                DEVICE_BATTERY_LEVEL,
                "BatteryLevel",
                ResourceKind::Integer,
            )
            .operations(Operations::Read),
        )
        .expect("device resources register once");
    registry
        .register_resource(
            ResourceDefinition::new(
                DEVICE_OBJECT,
                DEVICE_ERROR_CODE,
                "ErrorCode",
                ResourceKind::Integer,
            )
            .instances(1, 8)
            .operations(Operations::Read),
        )
        .expect("device resources register once");
    registry
        .register_resource(
            ResourceDefinition::new(
                DEVICE_OBJECT,
                DEVICE_CURRENT_TIME,
                "CurrentTime",
                ResourceKind::Time,
            )
            .operations(Operations::ReadWrite),
        )
        .expect("device resources register once");
    registry
        .register_resource(
            ResourceDefinition::new(
                DEVICE_OBJECT,
                DEVICE_SUPPORTED_BINDINGS,
                "SupportedBindingandModes",
                ResourceKind::String,
            )
            .operations(Operations::Read),
        )
        .expect("device resources register once");
}

fn read_integer(
    store: &ObjectStore,
    object: u16,
    instance: InstanceId,
    resource: u16,
) -> Option<i64> {
    match Value::from_store_bytes(ResourceKind::Integer, store.read(object, instance, resource, 0)?)
    {
        Ok(Value::Integer(v)) => Some(v),
        _ => None,
    }
}

fn read_string(
    store: &ObjectStore,
    object: u16,
    instance: InstanceId,
    resource: u16,
) -> Option<String> {
    match Value::from_store_bytes(ResourceKind::String, store.read(object, instance, resource, 0)?)
    {
        Ok(Value::String(v)) => Some(v),
        _ => None,
    }
}

fn read_boolean(
    store: &ObjectStore,
    object: u16,
    instance: InstanceId,
    resource: u16,
) -> Option<bool> {
    match Value::from_store_bytes(ResourceKind::Boolean, store.read(object, instance, resource, 0)?)
    {
        Ok(Value::Boolean(v)) => Some(v),
        _ => None,
    }
}

/// Extract `host:port` from a `coap://` or `coaps://` URI with a numeric
/// host. Hostname resolution belongs to the daemons.
pub fn parse_server_uri(uri: &str) -> Option<SocketAddr> {
    let rest = uri
        .strip_prefix("coap://")
        .or_else(|| uri.strip_prefix("coaps://"))?;
    let authority = rest.split('/').next()?;
    if authority.contains(':') && !authority.starts_with('[') && authority.matches(':').count() > 1
    {
        // Bare IPv6 literal; bracket it for SocketAddr.
        return None;
    }
    let candidate = if authority.contains(':') {
        authority.to_owned()
    } else {
        format!("{authority}:5683")
    };
    candidate.parse().ok()
}

/// The security object instance whose ServerURI addresses `address`.
fn security_instance_for(store: &ObjectStore, address: SocketAddr) -> Option<InstanceId> {
    let mut instance = store.next_instance(SECURITY_OBJECT, None);
    while let Some(id) = instance {
        if let Some(uri) = read_string(store, SECURITY_OBJECT, id, SECURITY_SERVER_URI) {
            if parse_server_uri(&uri) == Some(address) {
                return Some(id);
            }
        }
        instance = store.next_instance(SECURITY_OBJECT, Some(id));
    }
    None
}

/// The short server id configured for `address`, or 0 when unknown.
pub fn short_server_id_for(store: &ObjectStore, address: SocketAddr) -> u16 {
    security_instance_for(store, address)
        .and_then(|instance| {
            read_integer(store, SECURITY_OBJECT, instance, SECURITY_SHORT_SERVER_ID)
        })
        .and_then(|id| u16::try_from(id).ok())
        .unwrap_or(0)
}

/// Whether `address` is configured as the bootstrap server.
pub fn server_is_bootstrap(store: &ObjectStore, address: SocketAddr) -> bool {
    security_instance_for(store, address)
        .and_then(|instance| {
            read_boolean(store, SECURITY_OBJECT, instance, SECURITY_BOOTSTRAP_SERVER)
        })
        .unwrap_or(false)
}

/// The server object's default notification periods for `short_server_id`:
/// `(pmin, pmax)`, zero when unconfigured.
pub fn server_defaults(store: &ObjectStore, short_server_id: u16) -> (i64, i64) {
    let mut instance = store.next_instance(SERVER_OBJECT, None);
    while let Some(id) = instance {
        if read_integer(store, SERVER_OBJECT, id, SERVER_SHORT_SERVER_ID)
            == Some(short_server_id as i64)
        {
            return (
                read_integer(store, SERVER_OBJECT, id, SERVER_DEFAULT_MIN_PERIOD).unwrap_or(0),
                read_integer(store, SERVER_OBJECT, id, SERVER_DEFAULT_MAX_PERIOD).unwrap_or(0),
            );
        }
        instance = store.next_instance(SERVER_OBJECT, Some(id));
    }
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_objects_install_cleanly() {
        let mut registry = DefinitionRegistry::new();
        register_standard_objects(&mut registry);

        assert!(registry.lookup_object(SECURITY_OBJECT).is_some());
        assert!(registry.lookup_object(SERVER_OBJECT).is_some());
        assert!(registry.lookup_object(DEVICE_OBJECT).is_some());
        assert!(registry.is_resource_executable(DEVICE_OBJECT, DEVICE_REBOOT));
        assert!(!registry.is_resource_writable(SECURITY_OBJECT, SECURITY_SERVER_URI));
    }

    #[test]
    fn server_uris_parse_to_addresses() {
        assert_eq!(
            parse_server_uri("coap://192.0.2.10:5683"),
            Some("192.0.2.10:5683".parse().unwrap())
        );
        assert_eq!(
            parse_server_uri("coaps://192.0.2.10:5684/some/path"),
            Some("192.0.2.10:5684".parse().unwrap())
        );
        assert_eq!(
            parse_server_uri("coap://192.0.2.10"),
            Some("192.0.2.10:5683".parse().unwrap())
        );
        assert_eq!(parse_server_uri("http://192.0.2.10"), None);
    }

    fn store_with_security() -> ObjectStore {
        let mut store = ObjectStore::new();
        for object in [SECURITY_OBJECT, SERVER_OBJECT] {
            store.add_object(object);
        }
        store.create_instance(SECURITY_OBJECT, Some(0), 4).unwrap();
        for resource in [
            SECURITY_SERVER_URI,
            SECURITY_BOOTSTRAP_SERVER,
            SECURITY_SHORT_SERVER_ID,
        ] {
            store.create_resource(SECURITY_OBJECT, 0, resource).unwrap();
        }
        store
            .write(
                SECURITY_OBJECT,
                0,
                SECURITY_SERVER_URI,
                0,
                Value::String("coap://192.0.2.10:5683".into()).to_store_bytes(),
            )
            .unwrap();
        store
            .write(
                SECURITY_OBJECT,
                0,
                SECURITY_BOOTSTRAP_SERVER,
                0,
                Value::Boolean(false).to_store_bytes(),
            )
            .unwrap();
        store
            .write(
                SECURITY_OBJECT,
                0,
                SECURITY_SHORT_SERVER_ID,
                0,
                Value::Integer(1).to_store_bytes(),
            )
            .unwrap();
        store
    }

    #[test]
    fn short_server_id_resolves_by_address() {
        let store = store_with_security();
        assert_eq!(
            short_server_id_for(&store, "192.0.2.10:5683".parse().unwrap()),
            1
        );
        assert_eq!(
            short_server_id_for(&store, "192.0.2.99:5683".parse().unwrap()),
            0
        );
        assert!(!server_is_bootstrap(&store, "192.0.2.10:5683".parse().unwrap()));
    }

    #[test]
    fn notification_defaults_come_from_the_server_object() {
        let mut store = store_with_security();
        store.create_instance(SERVER_OBJECT, Some(0), 4).unwrap();
        for (resource, value) in [
            (SERVER_SHORT_SERVER_ID, 1i64),
            (SERVER_DEFAULT_MIN_PERIOD, 5),
            (SERVER_DEFAULT_MAX_PERIOD, 300),
        ] {
            store.create_resource(SERVER_OBJECT, 0, resource).unwrap();
            store
                .write(
                    SERVER_OBJECT,
                    0,
                    resource,
                    0,
                    Value::Integer(value).to_store_bytes(),
                )
                .unwrap();
        }

        assert_eq!(server_defaults(&store, 1), (5, 300));
        assert_eq!(server_defaults(&store, 9), (0, 0));
    }
}
