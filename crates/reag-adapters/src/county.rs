//! County assessor parcel API. Public data; the key is optional.

use async_trait::async_trait;
use reag_core::{AddressFields, ListingAttributes, MarketTrendPoint, RawRecord};
use reag_storage::FetchRequest;

use crate::{
    parse_entries, payload_json, raw_record, AdapterContext, AdapterKind, EntryCursor, EntryResult,
    ExtractionError, FetchedPayload, PayloadKind, SourceAdapter, Upstream,
};

#[derive(Debug, Clone)]
pub struct CountyAdapter {
    upstream: Upstream,
}

impl CountyAdapter {
    pub(crate) fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }

    fn request(&self, path: &str) -> FetchRequest {
        let request = FetchRequest::get(self.upstream.url(path));
        match &self.upstream.api_key {
            Some(key) => request.header("X-Api-Key", key.clone()),
            None => request,
        }
    }

    /// Assessor rolls carry assessed value rather than a list price; it is the
    /// closest thing the county has to a price.
    fn parcel(payload: &FetchedPayload, entry: &EntryCursor<'_>) -> EntryResult<RawRecord> {
        let external_id = entry.id("external_id")?;
        let address = AddressFields::new(
            entry.text(&["situs", "street"]),
            entry.text(&["situs", "city"]),
            entry.text(&["situs", "state"]),
            entry.text(&["situs", "zip"]),
        );
        let attributes = ListingAttributes {
            price: entry.number("assessed_value", &["assessed_value"])?,
            beds: entry.number("bedrooms", &["bedrooms"])?,
            baths: entry.number("bathrooms", &["bathrooms"])?,
            sqft: entry.number("building_sqft", &["building_sqft"])?,
            year_built: entry.year("year_built", &["year_built"])?,
            property_type: entry.opt_text(&["land_use"]),
            listing_status: None,
        };
        Ok(raw_record(payload, external_id, address, attributes))
    }
}

#[async_trait]
impl SourceAdapter for CountyAdapter {
    fn source_id(&self) -> &str {
        &self.upstream.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::County
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        location: &str,
        page: u32,
    ) -> Result<FetchedPayload, ExtractionError> {
        let request = self
            .request("parcels")
            .query("location", location)
            .query("page", page);
        let kind = PayloadKind::Search {
            location: location.to_string(),
            page,
        };
        self.upstream.fetch_json(ctx, request, kind).await
    }

    async fn fetch_property(
        &self,
        ctx: &AdapterContext,
        external_id: &str,
    ) -> Result<FetchedPayload, ExtractionError> {
        let request = self.request(&format!("parcels/{external_id}"));
        let kind = PayloadKind::Property {
            external_id: external_id.to_string(),
        };
        self.upstream.fetch_json(ctx, request, kind).await
    }

    async fn fetch_market_data(
        &self,
        ctx: &AdapterContext,
        resource_id: &str,
        beds: Option<u32>,
        property_types: &[String],
    ) -> Result<FetchedPayload, ExtractionError> {
        let mut request = self.request(&format!("sales-stats/{resource_id}"));
        if let Some(beds) = beds {
            request = request.query("bedrooms", beds);
        }
        if !property_types.is_empty() {
            request = request.query("land_use", property_types.join(","));
        }
        let kind = PayloadKind::MarketData {
            resource_id: resource_id.to_string(),
        };
        self.upstream.fetch_json(ctx, request, kind).await
    }

    fn parse_search(&self, payload: &FetchedPayload) -> Vec<EntryResult<RawRecord>> {
        parse_entries(payload, "results", |entry| Self::parcel(payload, entry))
    }

    fn parse_property(&self, payload: &FetchedPayload) -> EntryResult<RawRecord> {
        let root = payload_json(payload)?;
        Self::parcel(payload, &EntryCursor::new(&payload.source_id, &root))
    }

    fn parse_market_data(&self, payload: &FetchedPayload) -> Vec<EntryResult<MarketTrendPoint>> {
        let resource_id = match &payload.kind {
            PayloadKind::MarketData { resource_id } => resource_id.clone(),
            _ => String::new(),
        };
        parse_entries(payload, "results", |entry| {
            Ok(MarketTrendPoint {
                source_id: payload.source_id.clone(),
                resource_id: resource_id.clone(),
                period: entry.period("month")?,
                median_list_price: entry.number("median_sale_price", &["median_sale_price"])?,
                inventory: entry.count("sales_count", &["sales_count"])?,
            })
        })
    }
}
