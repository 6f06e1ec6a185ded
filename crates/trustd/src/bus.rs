//! Message bus connections shared by the bus transport and the store

use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::{connection, Connection};

use crate::config::BusScope;

/// Connect to the bus selected by `scope`
pub async fn connect(scope: BusScope) -> zbus::Result<Connection> {
    let builder = match scope {
        BusScope::Session => connection::Builder::session()?,
        BusScope::System => connection::Builder::system()?,
        BusScope::SessionFromEnv => {
            connection::Builder::address(address_from_env("DBUS_SESSION_BUS_ADDRESS")?.as_str())?
        }
        BusScope::SystemFromEnv => {
            connection::Builder::address(address_from_env("DBUS_SYSTEM_BUS_ADDRESS")?.as_str())?
        }
    };

    builder.build().await
}

fn address_from_env(var: &str) -> zbus::Result<String> {
    std::env::var(var).map_err(|_| zbus::Error::Address(format!("{} is not set", var)))
}

/// Become the sole owner of a well-known name. Never queues behind
/// another owner.
pub async fn claim_name(connection: &Connection, name: &str) -> zbus::Result<()> {
    let reply = connection
        .request_name_with_flags(name, RequestNameFlags::DoNotQueue.into())
        .await?;

    match reply {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => Ok(()),
        RequestNameReply::Exists | RequestNameReply::InQueue => Err(zbus::Error::NameTaken),
    }
}
