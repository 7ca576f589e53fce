//! Aggregated GraphQL query construction and response demultiplexing.
//!
//! A batch of N lookups becomes one query with N aliased `product(handle:)`
//! fields `p0..pN-1`, each bound to its own `$h{i}` variable. The response is
//! mapped back to the requests by position.

use std::collections::BTreeMap;

use catalogsync_shared::{
    CanonicalProduct, CatalogError, ProductImage, ProductLookupRequest, ProductOption,
    ProductVariant, Result, strip_gid,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Selection set requested for every product.
const PRODUCT_FIELDS: &str = "\
    id
    title
    descriptionHtml
    vendor
    productType
    tags
    featuredImage { id url }
    images(first: 100) { edges { node { id url } } }
    options { name values }
    createdAt
    updatedAt
    publishedAt
    variants(first: 100) { edges { node { id title sku availableForSale requiresShipping weight weightUnit barcode image { id url } price { amount currencyCode } selectedOptions { name value } } } }";

// ---------------------------------------------------------------------------
// BatchQuery
// ---------------------------------------------------------------------------

/// One aggregated query, serialised as the JSON request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchQuery {
    pub query: String,
    pub variables: BTreeMap<String, String>,
}

/// A request paired with the product it resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProduct {
    pub request: ProductLookupRequest,
    pub product: CanonicalProduct,
}

fn alias(index: usize) -> String {
    format!("p{index}")
}

fn variable(index: usize) -> String {
    format!("h{index}")
}

/// Build the aggregated query for `requests`, preserving their order.
pub fn build_batch_query(requests: &[ProductLookupRequest]) -> BatchQuery {
    let mut variables = BTreeMap::new();
    let mut params = Vec::with_capacity(requests.len());
    let mut fields = Vec::with_capacity(requests.len());

    for (i, request) in requests.iter().enumerate() {
        let var = variable(i);
        params.push(format!("${var}: String!"));
        fields.push(format!(
            "{}: product(handle: ${var}) {{\n{PRODUCT_FIELDS}\n  }}",
            alias(i)
        ));
        variables.insert(var, request.handle.clone());
    }

    BatchQuery {
        query: format!("query({}) {{\n{}\n}}", params.join(", "), fields.join("\n")),
        variables,
    }
}

// ---------------------------------------------------------------------------
// Response fragments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    id: Option<String>,
    url: Option<String>,
}

impl RawImage {
    fn into_image(self) -> Option<ProductImage> {
        self.url.map(|src| ProductImage { id: self.id, src })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMoney {
    amount: Option<String>,
    currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSelectedOption {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVariant {
    id: String,
    title: Option<String>,
    sku: Option<String>,
    available_for_sale: Option<bool>,
    requires_shipping: Option<bool>,
    weight: Option<f64>,
    weight_unit: Option<String>,
    barcode: Option<String>,
    image: Option<RawImage>,
    price: Option<RawMoney>,
    selected_options: Option<Vec<RawSelectedOption>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    id: String,
    title: String,
    description_html: Option<String>,
    vendor: Option<String>,
    product_type: Option<String>,
    tags: Option<Vec<String>>,
    featured_image: Option<RawImage>,
    images: Option<Connection<RawImage>>,
    options: Option<Vec<RawOption>>,
    variants: Option<Connection<RawVariant>>,
    created_at: Option<String>,
    updated_at: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOption {
    name: String,
    values: Option<Vec<String>>,
}

impl RawVariant {
    fn into_variant(self) -> ProductVariant {
        let options = self
            .selected_options
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .filter_map(|(i, opt)| opt.value.map(|v| (format!("option{}", i + 1), v)))
            .collect();
        let (price, currency_code) = match self.price {
            Some(money) => (money.amount, money.currency_code),
            None => (None, None),
        };

        ProductVariant {
            id: self.id,
            title: self.title,
            sku: self.sku,
            available_for_sale: self.available_for_sale,
            requires_shipping: self.requires_shipping,
            weight: self.weight,
            weight_unit: self.weight_unit,
            barcode: self.barcode,
            price,
            currency_code,
            image_id: self.image.and_then(|img| img.id),
            options,
        }
    }
}

impl RawProduct {
    fn into_product(self) -> CanonicalProduct {
        let image = self.featured_image.and_then(RawImage::into_image);

        let mut images: Vec<ProductImage> = self
            .images
            .map(|c| c.edges)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| e.node.into_image())
            .collect();
        if let Some(featured) = &image {
            images.push(featured.clone());
        }

        let options = self
            .options
            .unwrap_or_default()
            .into_iter()
            .map(|o| ProductOption {
                name: o.name,
                values: o.values.unwrap_or_default(),
            })
            .collect();

        let variants = self
            .variants
            .map(|c| c.edges)
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.node.into_variant())
            .collect();

        CanonicalProduct {
            id: strip_gid(&self.id),
            raw_id: self.id,
            title: self.title,
            description_html: self.description_html,
            vendor: self.vendor,
            product_type: self.product_type,
            tags: self.tags.unwrap_or_default(),
            image,
            images,
            options,
            variants,
            created_at: self.created_at,
            updated_at: self.updated_at,
            published_at: self.published_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Demultiplexing
// ---------------------------------------------------------------------------

/// Map the `data` object of a batch response back to its requests.
///
/// Fragments that are null or carry no title are products the storefront
/// does not know; they are skipped. A fragment that does not match the
/// expected shape fails the whole batch.
pub fn demultiplex(
    data: &Value,
    requests: &[ProductLookupRequest],
) -> Result<Vec<ResolvedProduct>> {
    let mut resolved = Vec::with_capacity(requests.len());

    for (i, request) in requests.iter().enumerate() {
        let key = alias(i);
        let Some(fragment) = data.get(&key) else {
            debug!(handle = %request.handle, "product not found");
            continue;
        };
        let has_title = fragment
            .get("title")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !has_title {
            debug!(handle = %request.handle, "product not found");
            continue;
        }

        let raw: RawProduct = serde_json::from_value(fragment.clone()).map_err(|e| {
            CatalogError::Query(format!("malformed product fragment {key}: {e}"))
        })?;

        resolved.push(ResolvedProduct {
            request: request.clone(),
            product: raw.into_product(),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(handle: &str) -> ProductLookupRequest {
        ProductLookupRequest {
            origin: "https://shop.example".into(),
            handle: handle.into(),
            source_url: format!("https://shop.example/products/{handle}"),
        }
    }

    #[test]
    fn builds_aliased_query() {
        let q = build_batch_query(&[request("a"), request("b")]);
        assert!(q.query.starts_with("query($h0: String!, $h1: String!) {"));
        assert!(q.query.contains("p0: product(handle: $h0) {"));
        assert!(q.query.contains("p1: product(handle: $h1) {"));
        assert!(q.query.contains("selectedOptions { name value }"));
        assert_eq!(q.variables.get("h0").map(String::as_str), Some("a"));
        assert_eq!(q.variables.get("h1").map(String::as_str), Some("b"));

        let body = serde_json::to_value(&q).unwrap();
        assert_eq!(body["variables"], json!({"h0": "a", "h1": "b"}));
    }

    #[test]
    fn demultiplexes_and_normalizes() {
        let data = json!({
            "p0": {
                "id": "gid://shopify/Product/123",
                "title": "Shirt",
                "descriptionHtml": "<p>Soft</p>",
                "vendor": "Acme",
                "tags": ["summer"],
                "featuredImage": {"id": "gid://shopify/ProductImage/9", "url": "https://cdn.example/f.jpg"},
                "images": {"edges": [{"node": {"id": "gid://shopify/ProductImage/1", "url": "https://cdn.example/1.jpg"}}]},
                "options": [{"name": "Color", "values": ["Red", "Blue"]}, {"name": "Size", "values": ["M"]}],
                "variants": {"edges": [{"node": {
                    "id": "gid://shopify/ProductVariant/5",
                    "title": "Red / M",
                    "sku": "SH-R-M",
                    "availableForSale": true,
                    "weight": 0.5,
                    "weightUnit": "KILOGRAMS",
                    "image": {"id": "gid://shopify/ProductImage/1", "url": "https://cdn.example/1.jpg"},
                    "price": {"amount": "19.90", "currencyCode": "EUR"},
                    "selectedOptions": [{"name": "Color", "value": "Red"}, {"name": "Size", "value": "M"}]
                }}]}
            },
            "p1": null,
            "p2": {"id": "gid://shopify/Product/77", "title": null}
        });

        let resolved =
            demultiplex(&data, &[request("shirt"), request("gone"), request("untitled")]).unwrap();
        assert_eq!(resolved.len(), 1);

        let product = &resolved[0].product;
        assert_eq!(resolved[0].request.handle, "shirt");
        assert_eq!(product.id, "123");
        assert_eq!(product.raw_id, "gid://shopify/Product/123");
        assert_eq!(product.images.len(), 2);
        assert_eq!(product.images[1].src, "https://cdn.example/f.jpg");
        assert_eq!(product.image.as_ref().map(|i| i.src.as_str()), Some("https://cdn.example/f.jpg"));

        let variant = &product.variants[0];
        assert_eq!(variant.option(0), Some("Red"));
        assert_eq!(variant.option(1), Some("M"));
        assert_eq!(variant.option(2), None);
        assert_eq!(variant.price.as_deref(), Some("19.90"));
        assert_eq!(variant.currency_code.as_deref(), Some("EUR"));
        assert_eq!(variant.image_id.as_deref(), Some("gid://shopify/ProductImage/1"));
    }

    #[test]
    fn missing_data_skips_everything() {
        let resolved = demultiplex(&Value::Null, &[request("a")]).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn malformed_fragment_fails_batch() {
        let data = json!({"p0": {"title": "No id"}});
        assert!(demultiplex(&data, &[request("a")]).is_err());
    }
}
