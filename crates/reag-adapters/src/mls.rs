//! Regional MLS feed (RESO-style field names, bearer-token auth).

use async_trait::async_trait;
use reag_core::{AddressFields, ListingAttributes, MarketTrendPoint, RawRecord};
use reag_storage::FetchRequest;

use crate::{
    parse_entries, payload_json, raw_record, AdapterContext, AdapterKind, EntryCursor, EntryResult,
    ExtractionError, FetchedPayload, PayloadKind, SourceAdapter, Upstream,
};

#[derive(Debug, Clone)]
pub struct MlsAdapter {
    upstream: Upstream,
}

impl MlsAdapter {
    pub(crate) fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }

    fn request(&self, path: &str) -> FetchRequest {
        FetchRequest::get(self.upstream.url(path))
            .header("Authorization", format!("Bearer {}", self.upstream.api_key()))
            .header("Accept", "application/json")
    }

    fn listing(payload: &FetchedPayload, entry: &EntryCursor<'_>) -> EntryResult<RawRecord> {
        let external_id = entry.id("external_id")?;
        let address = AddressFields::new(
            entry.text(&["street"]),
            entry.text(&["city"]),
            entry.text(&["state"]),
            entry.text(&["postal_code"]),
        );
        let attributes = ListingAttributes {
            price: entry.number("list_price", &["list_price"])?,
            beds: entry.number("beds", &["beds"])?,
            baths: entry.number("baths_total", &["baths_total"])?,
            sqft: entry.number("living_area", &["living_area"])?,
            year_built: entry.year("year_built", &["year_built"])?,
            property_type: entry.opt_text(&["property_sub_type"]),
            listing_status: entry.opt_text(&["status"]),
        };
        Ok(raw_record(payload, external_id, address, attributes))
    }
}

#[async_trait]
impl SourceAdapter for MlsAdapter {
    fn source_id(&self) -> &str {
        &self.upstream.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Mls
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        location: &str,
        page: u32,
    ) -> Result<FetchedPayload, ExtractionError> {
        let request = self
            .request("listings")
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
        let request = self.request(&format!("listings/{external_id}"));
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
        let mut request = self.request(&format!("market/{resource_id}"));
        if let Some(beds) = beds {
            request = request.query("beds", beds);
        }
        for property_type in property_types {
            request = request.query("property_type", property_type);
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
        parse_entries(payload, "results", |entry| {
            Ok(MarketTrendPoint {
                source_id: payload.source_id.clone(),
                resource_id: resource_id.clone(),
                period: entry.period("period")?,
                median_list_price: entry.number("median_list_price", &["median_list_price"])?,
                inventory: entry.count("active_listings", &["active_listings"])?,
            })
        })
    }
}
