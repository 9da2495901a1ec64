//! Sample catalog for development installs. Safe to run on every start:
//! categories and brands are matched by slug, products by SKU.

use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::value_objects::Slug;
use crate::services::catalog::{NewProduct, NewVariant};
use crate::services::CatalogService;
use crate::store::StorefrontStore;
use crate::Result;

const CATEGORIES: [(&str, &str); 5] = [
    ("Men's Clothing", "Fashionable clothing for men"),
    ("Women's Clothing", "Elegant clothing for women"),
    ("Kids Clothing", "Comfortable clothing for children"),
    ("Accessories", "Fashion accessories and jewelry"),
    ("Footwear", "Shoes, sandals, and boots"),
];

const BRANDS: [(&str, &str); 4] = [
    ("Fashion Forward", "Trendy and modern fashion"),
    ("Classic Style", "Timeless and elegant designs"),
    ("Urban Trend", "Street style and casual wear"),
    ("Luxury Brand", "Premium quality fashion items"),
];

struct SampleProduct {
    sku: &'static str,
    name: &'static str,
    description: &'static str,
    category: usize,
    brand: usize,
    /// Minor units (poisha).
    price: i64,
    sale_price: Option<i64>,
    stock: u32,
    featured: bool,
    new_arrival: bool,
    sizes: &'static [&'static str],
    colors: &'static [&'static str],
    variant_stock: (u32, u32),
}

const PRODUCTS: [SampleProduct; 5] = [
    SampleProduct {
        sku: "SEED-MEN-TSHIRT",
        name: "Men's Casual T-Shirt",
        description: "Comfortable cotton t-shirt for everyday wear",
        category: 0, brand: 0, price: 2599_00, sale_price: Some(1999_00), stock: 100,
        featured: true, new_arrival: true,
        sizes: &["S", "M", "L", "XL"], colors: &["Red", "Blue", "Black", "White"], variant_stock: (10, 30),
    },
    SampleProduct {
        sku: "SEED-WOMEN-DRESS",
        name: "Women's Summer Dress",
        description: "Beautiful summer dress perfect for any occasion",
        category: 1, brand: 1, price: 4599_00, sale_price: None, stock: 50,
        featured: true, new_arrival: false,
        sizes: &["S", "M", "L", "XL"], colors: &["Red", "Blue", "Black", "White"], variant_stock: (10, 30),
    },
    SampleProduct {
        sku: "SEED-KIDS-JEANS",
        name: "Kids Comfortable Jeans",
        description: "Durable and comfortable jeans for active children",
        category: 2, brand: 2, price: 3599_00, sale_price: Some(2999_00), stock: 75,
        featured: false, new_arrival: true,
        sizes: &["2T", "3T", "4T", "5T", "6T"], colors: &["Blue", "Black"], variant_stock: (15, 25),
    },
    SampleProduct {
        sku: "SEED-SUNGLASSES",
        name: "Stylish Sunglasses",
        description: "Trendy sunglasses with UV protection",
        category: 3, brand: 3, price: 8999_00, sale_price: Some(6999_00), stock: 30,
        featured: true, new_arrival: false,
        sizes: &[], colors: &[], variant_stock: (0, 0),
    },
    SampleProduct {
        sku: "SEED-SNEAKERS",
        name: "Comfortable Sneakers",
        description: "Lightweight sneakers perfect for daily use",
        category: 4, brand: 0, price: 7999_00, sale_price: None, stock: 60,
        featured: false, new_arrival: true,
        sizes: &["7", "8", "9", "10", "11"], colors: &["White", "Black", "Gray"], variant_stock: (8, 20),
    },
];

/// What a seeding run added.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub categories: usize,
    pub brands: usize,
    pub products: usize,
    pub variants: usize,
}

fn slug(name: &str) -> Result<String> { Ok(Slug::from_name(name)?.into_inner()) }

pub async fn seed_sample_data(store: Arc<dyn StorefrontStore>) -> Result<SeedReport> {
    let catalog = CatalogService::new(store.clone());
    let mut report = SeedReport::default();

    let mut category_ids: HashMap<String, Uuid> = catalog.categories().await?.into_iter().map(|c| (c.slug, c.id)).collect();
    let mut categories = Vec::with_capacity(CATEGORIES.len());
    for (name, description) in CATEGORIES {
        let key = slug(name)?;
        let id = match category_ids.get(&key) {
            Some(id) => *id,
            None => {
                let created = catalog.create_category(name, Some(description.to_string()), None).await?;
                report.categories += 1;
                category_ids.insert(key, created.id);
                created.id
            }
        };
        categories.push(id);
    }

    let mut brand_ids: HashMap<String, Uuid> = catalog.brands().await?.into_iter().map(|b| (b.slug, b.id)).collect();
    let mut brands = Vec::with_capacity(BRANDS.len());
    for (name, description) in BRANDS {
        let key = slug(name)?;
        let id = match brand_ids.get(&key) {
            Some(id) => *id,
            None => {
                let created = catalog.create_brand(name, Some(description.to_string())).await?;
                report.brands += 1;
                brand_ids.insert(key, created.id);
                created.id
            }
        };
        brands.push(id);
    }

    for sample in &PRODUCTS {
        if store.product_by_sku(sample.sku).await?.is_some() {
            continue;
        }
        let product = catalog
            .create_product(NewProduct {
                sku: Some(sample.sku.to_string()),
                name: sample.name.to_string(),
                description: sample.description.to_string(),
                category_id: categories.get(sample.category).copied(),
                brand_id: brands.get(sample.brand).copied(),
                price: Decimal::new(sample.price, 2),
                sale_price: sample.sale_price.map(|p| Decimal::new(p, 2)),
                stock: sample.stock,
                is_featured: sample.featured,
                is_new_arrival: sample.new_arrival,
                images: vec![],
                tags: vec![],
                publish: true,
            })
            .await?;
        report.products += 1;

        let options = sample.sizes.iter().map(|v| ("Size", *v)).chain(sample.colors.iter().map(|v| ("Color", *v)));
        for (name, value) in options {
            let (low, high) = sample.variant_stock;
            let stock = rand::thread_rng().gen_range(low..=high);
            catalog
                .add_variant(product.id, NewVariant { name: name.to_string(), value: value.to_string(), sku: None, price_override: None, stock })
                .await?;
            report.variants += 1;
        }
    }

    info!(
        categories = report.categories,
        brands = report.brands,
        products = report.products,
        variants = report.variants,
        "sample catalog seeded"
    );
    Ok(report)
}
