//! Zillow through the RapidAPI gateway.

use async_trait::async_trait;
use reag_core::{AddressFields, ListingAttributes, MarketTrendPoint, RawRecord};
use reag_storage::FetchRequest;

use crate::{
    parse_entries, payload_json, raw_record, AdapterContext, AdapterKind, EntryCursor, EntryResult,
    ExtractionError, FetchedPayload, PayloadKind, SourceAdapter, Upstream,
};

#[derive(Debug, Clone)]
pub struct ZillowAdapter {
    upstream: Upstream,
}

impl ZillowAdapter {
    pub(crate) fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }

    /// RapidAPI routes on the `X-RapidAPI-Host` header, which is the bare host
    /// of the configured base URL.
    fn rapidapi_host(&self) -> &str {
        let base = &self.upstream.base_url;
        let without_scheme = base.split_once("://").map_or(base.as_str(), |(_, rest)| rest);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }

    fn request(&self, path: &str) -> FetchRequest {
        FetchRequest::get(self.upstream.url(path))
            .header("X-RapidAPI-Key", self.upstream.api_key())
            .header("X-RapidAPI-Host", self.rapidapi_host())
    }

    fn listing(payload: &FetchedPayload, entry: &EntryCursor<'_>) -> EntryResult<RawRecord> {
        let external_id = entry.id("zpid")?;
        let attributes = ListingAttributes {
            price: entry.number("price", &["price"])?,
            beds: entry.number("bedrooms", &["bedrooms"])?,
            baths: entry.number("bathrooms", &["bathrooms"])?,
            sqft: entry.number("livingArea", &["livingArea"])?,
            year_built: entry.year("yearBuilt", &["yearBuilt"])?,
            property_type: entry.opt_text(&["homeType"]),
            listing_status: entry.opt_text(&["homeStatus"]),
        };
        let address = AddressFields::parse_single_line(&entry.text(&["address"]));
        Ok(raw_record(payload, external_id, address, attributes))
    }
}

#[async_trait]
impl SourceAdapter for ZillowAdapter {
    fn source_id(&self) -> &str {
        &self.upstream.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Zillow
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        location: &str,
        page: u32,
    ) -> Result<FetchedPayload, ExtractionError> {
        let request = self
            .request("propertyExtendedSearch")
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
        let request = self.request("property").query("zpid", external_id);
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
        let mut request = self.request("marketData").query("resourceId", resource_id);
        if let Some(beds) = beds {
            request = request.query("beds", beds);
        }
        if !property_types.is_empty() {
            request = request.query("propertyTypes", property_types.join(","));
        }
        let kind = PayloadKind::MarketData {
            resource_id: resource_id.to_string(),
        };
        self.upstream.fetch_json(ctx, request, kind).await
    }

    fn parse_search(&self, payload: &FetchedPayload) -> Vec<EntryResult<RawRecord>> {
        parse_entries(payload, "results", |entry| Self::listing(payload, entry))
    }

    fn parse_property(&self, payload: &FetchedPayload) -> EntryResult<RawRecord> {
        let root = payload_json(payload)?;
        Self::listing(payload, &EntryCursor::new(&payload.source_id, &root))
    }

    fn parse_market_data(&self, payload: &FetchedPayload) -> Vec<EntryResult<MarketTrendPoint>> {
        let resource_id = match &payload.kind {
            PayloadKind::MarketData { resource_id } => resource_id.clone(),
            _ => String::new(),
        };
        parse_entries(payload, "marketTrends", |entry| {
            Ok(MarketTrendPoint {
                source_id: payload.source_id.clone(),
                resource_id: resource_id.clone(),
                period: entry.period("date")?,
                median_list_price: entry.number("medianListPrice", &["medianListPrice"])?,
                inventory: entry.count("inventory", &["inventory"])?,
            })
        })
    }
}
