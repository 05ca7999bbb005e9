use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;

use crate::{
    api::Geocoder,
    entities::Coordinates,
    error::{invalid_input_error, upstream_error, Error},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Geometry {
    pub location: Coordinates,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Response {
    status: String,
    results: Option<Vec<GeocodeResult>>,
}

/// Forward geocoder backed by the HTTP geocoding collaborator.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpGeocoder;

#[async_trait]
impl Geocoder for HttpGeocoder {
    #[tracing::instrument(skip(self))]
    async fn geocode(&self, address: &str) -> Result<Coordinates, Error> {
        let api_base = env::var("GEOCODING_API_BASE")?;
        let url = format!("https://{}/maps/api/geocode/json", api_base);
        let key = env::var("GEOCODING_API_KEY")?;

        let res = reqwest::Client::new()
            .get(url)
            .query(&[("key", key)])
            .query(&[("address", address.to_string())])
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if status_code >= 400 && status_code < 500 {
            return Err(invalid_input_error());
        } else if status_code != 200 {
            return Err(upstream_error());
        }

        let data: Response = res.json().await?;

        if data.status != "OK" {
            return Err(upstream_error());
        }

        let result = data
            .results
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| upstream_error())?;

        Ok(result.geometry.location)
    }
}
