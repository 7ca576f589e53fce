//! Normalisation of a resolved product into an [`OutputItem`].

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use catalogsync_shared::{
    AdditionalInfo, CanonicalProduct, OutputItem, ProductVariant, VariantSummary, strip_gid,
};
use catalogsync_transform::helpers::{strip_html, strip_url_query, to_snake_case, unique_defined};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

/// Option names marking a product without real variants.
static DEFAULT_OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Default|title)").expect("default option regex"));

/// Option properties promoted to top-level record fields or never emitted.
const RESERVED_PROPS: &[&str] = &[
    "color",
    "size",
    "material",
    "created_at",
    "updated_at",
    "published_at",
];

/// Variant label (`"Color: Red / Size: M"`) and its snake_cased properties.
///
/// A product whose first option is the platform's default option yields
/// `"Default"` and no properties.
pub fn variant_attributes(
    variant: &ProductVariant,
    product: &CanonicalProduct,
) -> (String, BTreeMap<String, String>) {
    if product
        .options
        .first()
        .is_some_and(|o| DEFAULT_OPTION_RE.is_match(&o.name))
    {
        return ("Default".into(), BTreeMap::new());
    }

    let mut label = Vec::new();
    let mut props = BTreeMap::new();
    for (i, option) in product.options.iter().enumerate() {
        if let Some(value) = variant.option(i) {
            props.insert(to_snake_case(&option.name), value.to_string());
            label.push(format!("{}: {value}", option.name));
        }
    }
    (label.join(" / "), props)
}

/// Build the output record for `product`, found at `url`.
pub fn map_to_record(
    product: &CanonicalProduct,
    url: &str,
    currency_fallback: &str,
    scraped_at: DateTime<Utc>,
) -> OutputItem {
    let empty = ProductVariant::default();
    let primary = product.variants.first().unwrap_or(&empty);
    let (variant_label, mut props) = variant_attributes(primary, product);

    let description = product
        .description_html
        .as_deref()
        .map(strip_html)
        .filter(|d| !d.is_empty());

    let sku = match primary.sku.as_deref() {
        Some(sku) if !sku.is_empty() => sku.to_string(),
        _ if !primary.id.is_empty() => strip_gid(&primary.id),
        _ => String::new(),
    };

    let price = primary
        .price
        .as_deref()
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| *p != 0.0);

    let availability = if primary.available_for_sale.unwrap_or(false) {
        "in stock"
    } else {
        "out of stock"
    };

    let weight = primary.weight.filter(|w| *w != 0.0).map(|w| {
        format!("{w} {}", primary.weight_unit.as_deref().unwrap_or_default())
            .trim_end()
            .to_string()
    });

    let tags = unique_defined(&product.tags.iter().cloned().map(Value::String).collect::<Vec<_>>())
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    let variants = product
        .variants
        .iter()
        .map(|v| VariantSummary {
            id: v.id.clone(),
            sku: v.sku.clone(),
            title: v.title.clone(),
            price: v.price.clone(),
            image_id: v.image_id.clone(),
        })
        .collect();

    let color = props.remove("color");
    let size = props.remove("size");
    let material = props.remove("material");
    props.retain(|k, _| !RESERVED_PROPS.contains(&k.as_str()));

    OutputItem {
        url: url.to_string(),
        id: product.id.clone(),
        title: product.title.clone(),
        description,
        brand: product.vendor.clone(),
        sku,
        availability: availability.into(),
        price,
        currency: primary
            .currency_code
            .clone()
            .unwrap_or_else(|| currency_fallback.to_string()),
        color,
        size,
        material,
        // The storefront query does not expose a display name.
        display_name: None,
        images_urls: image_urls(product, primary),
        video_urls: Vec::new(),
        additional: AdditionalInfo {
            variant_attributes: variant_label,
            variant_title: primary.title.clone(),
            scraped_at,
            barcode: primary.barcode.clone().filter(|b| !b.is_empty()),
            taxcode: None,
            tags,
            weight,
            variants,
            extra: props,
        },
    }
}

/// Variant image, then gallery, then featured image; query strings removed,
/// duplicates dropped.
fn image_urls(product: &CanonicalProduct, primary: &ProductVariant) -> Vec<String> {
    let by_id: HashMap<&str, &str> = product
        .images
        .iter()
        .chain(product.image.iter())
        .filter_map(|img| img.id.as_deref().map(|id| (id, img.src.as_str())))
        .collect();

    let candidates: Vec<Value> = primary
        .image_id
        .as_deref()
        .and_then(|id| by_id.get(id).copied())
        .into_iter()
        .chain(product.images.iter().map(|img| img.src.as_str()))
        .chain(product.image.iter().map(|img| img.src.as_str()))
        .filter(|src| !src.is_empty())
        .map(|src| Value::String(strip_url_query(src)))
        .collect();

    unique_defined(&candidates)
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use catalogsync_shared::{ProductImage, ProductOption};

    use super::*;

    fn image(id: &str, src: &str) -> ProductImage {
        ProductImage {
            id: Some(id.into()),
            src: src.into(),
        }
    }

    fn shirt() -> CanonicalProduct {
        let mut variant = ProductVariant {
            id: "gid://shopify/ProductVariant/5".into(),
            title: Some("Red / M".into()),
            sku: Some("SH-R-M".into()),
            available_for_sale: Some(true),
            weight: Some(0.5),
            weight_unit: Some("KILOGRAMS".into()),
            price: Some("19.90".into()),
            currency_code: Some("EUR".into()),
            image_id: Some("img-2".into()),
            ..Default::default()
        };
        variant.options.insert("option1".into(), "Red".into());
        variant.options.insert("option2".into(), "M".into());
        variant.options.insert("option3".into(), "Organic".into());

        CanonicalProduct {
            id: "123".into(),
            raw_id: "gid://shopify/Product/123".into(),
            title: "Shirt".into(),
            description_html: Some("<p>Soft <b>cotton</b></p>".into()),
            vendor: Some("Acme".into()),
            product_type: None,
            tags: vec!["summer".into(), "cotton".into(), "summer".into()],
            image: Some(image("img-9", "https://cdn.example/f.jpg?v=3")),
            images: vec![
                image("img-1", "https://cdn.example/1.jpg?v=1"),
                image("img-2", "https://cdn.example/2.jpg?v=1"),
                image("img-9", "https://cdn.example/f.jpg?v=3"),
            ],
            options: vec![
                ProductOption {
                    name: "Color".into(),
                    values: vec!["Red".into()],
                },
                ProductOption {
                    name: "Size".into(),
                    values: vec!["M".into()],
                },
                ProductOption {
                    name: "Fabric Type".into(),
                    values: vec!["Organic".into()],
                },
            ],
            variants: vec![variant],
            created_at: None,
            updated_at: None,
            published_at: None,
        }
    }

    #[test]
    fn maps_primary_variant() {
        let item = map_to_record(&shirt(), "https://shop.example/products/shirt", "USD", Utc::now());

        assert_eq!(item.id, "123");
        assert_eq!(item.description.as_deref(), Some("Soft cotton"));
        assert_eq!(item.brand.as_deref(), Some("Acme"));
        assert_eq!(item.sku, "SH-R-M");
        assert_eq!(item.price, Some(19.9));
        assert_eq!(item.currency, "EUR");
        assert_eq!(item.availability, "in stock");
        assert_eq!(item.color.as_deref(), Some("Red"));
        assert_eq!(item.size.as_deref(), Some("M"));
        assert_eq!(item.material, None);
        assert_eq!(
            item.images_urls,
            vec![
                "https://cdn.example/2.jpg",
                "https://cdn.example/1.jpg",
                "https://cdn.example/f.jpg",
            ]
        );

        let additional = &item.additional;
        assert_eq!(
            additional.variant_attributes,
            "Color: Red / Size: M / Fabric Type: Organic"
        );
        assert_eq!(additional.weight.as_deref(), Some("0.5 KILOGRAMS"));
        assert_eq!(additional.tags, vec!["summer", "cotton"]);
        assert_eq!(additional.extra.get("fabric_type").map(String::as_str), Some("Organic"));
        assert!(!additional.extra.contains_key("color"));
        assert_eq!(additional.variants.len(), 1);
        assert_eq!(additional.variants[0].id, "gid://shopify/ProductVariant/5");
    }

    #[test]
    fn default_option_and_missing_variant_fields() {
        let mut product = shirt();
        product.options = vec![ProductOption {
            name: "Title".into(),
            values: vec!["Default Title".into()],
        }];
        let variant = &mut product.variants[0];
        variant.sku = Some(String::new());
        variant.price = None;
        variant.currency_code = None;
        variant.available_for_sale = Some(false);
        variant.weight = None;

        let item = map_to_record(&product, "https://shop.example/products/shirt", "USD", Utc::now());
        assert_eq!(item.additional.variant_attributes, "Default");
        assert!(item.additional.extra.is_empty());
        assert_eq!(item.color, None);
        assert_eq!(item.sku, "5");
        assert_eq!(item.price, None);
        assert_eq!(item.currency, "USD");
        assert_eq!(item.availability, "out of stock");
        assert_eq!(item.additional.weight, None);
    }

    #[test]
    fn product_without_variants() {
        let mut product = shirt();
        product.variants.clear();
        product.description_html = Some("   ".into());

        let item = map_to_record(&product, "https://shop.example/products/shirt", "USD", Utc::now());
        assert_eq!(item.sku, "");
        assert_eq!(item.description, None);
        assert_eq!(item.additional.variant_attributes, "");
        assert!(item.additional.variants.is_empty());
        assert_eq!(item.images_urls.len(), 3);
    }
}
