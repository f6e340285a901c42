use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    backend::{BackendError, DataStore, Filter, Table},
    structs::{AuthSession, NewProperty, Property},
};

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(BackendError::from))
        .collect()
}

pub async fn create_property(
    store: &dyn DataStore,
    auth: &AuthSession,
    property: &NewProperty,
) -> Result<(), BackendError> {
    let row = serde_json::to_value(property)?;
    store
        .insert(&auth.access_token, Table::Properties, vec![row])
        .await
        .map_err(|e| {
            log::error!("Error adding property for {}: {}", property.landlord_id, e);
            e
        })?;
    log::info!(
        "Property created for {}: {}, {} ({} units)",
        property.landlord_id,
        property.address,
        property.city,
        property.num_units
    );
    Ok(())
}

/// All properties owned by the signed-in user, in the store's default order.
pub async fn get_properties_for_landlord(
    store: &dyn DataStore,
    auth: &AuthSession,
) -> Result<Vec<Property>, BackendError> {
    let rows = store
        .select(
            &auth.access_token,
            Table::Properties,
            &Filter::eq("landlord_id", auth.user.id.as_str()),
        )
        .await?;
    let properties = decode_rows::<Property>(rows)?;
    log::debug!("Loaded {} properties for {}", properties.len(), auth.user.id);
    Ok(properties)
}
