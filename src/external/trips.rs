use async_trait::async_trait;
use chrono::NaiveDate;
use std::env;

use crate::{
    api::TripSource,
    entities::TripSheet,
    error::{invalid_input_error, upstream_error, Error},
};

/// Client for the trip-aggregation endpoint. Authentication is an external
/// concern: the token arrives here as an opaque bearer string.
#[derive(Clone, Debug)]
pub struct HttpTripSource {
    token: String,
}

impl HttpTripSource {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TripSource for HttpTripSource {
    #[tracing::instrument(skip(self))]
    async fn fetch_trip_sheet(&self, date: NaiveDate) -> Result<TripSheet, Error> {
        let api_base = env::var("TRIPS_API_BASE")?;
        let url = format!("https://{}/trips/sheet", api_base);

        let res = reqwest::Client::new()
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("date", date.format("%Y-%m-%d").to_string())])
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if status_code >= 400 && status_code < 500 {
            return Err(invalid_input_error());
        } else if status_code != 200 {
            return Err(upstream_error());
        }

        Ok(res.json().await?)
    }
}
