use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Flow Request
// ============================================================================

/// The `userInput` discriminator the flow API dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserInput {
    Search {
        value: String,
    },
    SimilarProducts {
        #[serde(rename = "productId")]
        product_id: String,
    },
}

impl UserInput {
    pub fn search(value: impl Into<String>) -> Self {
        Self::Search { value: value.into() }
    }

    pub fn similar_products(product_id: impl Into<String>) -> Self {
        Self::SimilarProducts { product_id: product_id.into() }
    }

    /// The free-text the backend sees, used by the mock to pick a behavior.
    pub fn text(&self) -> &str {
        match self {
            Self::Search { value } => value,
            Self::SimilarProducts { product_id } => product_id,
        }
    }
}

/// Body of `POST {apiBase}/flow/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub language: String,
    #[serde(rename = "userInput")]
    pub user_input: UserInput,
}

// ============================================================================
// Widgets
// ============================================================================

/// One streamed unit of result content.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Widget {
    Text(TextWidget),
    Product(ProductWidget),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextWidget {
    pub text: String,
}

/// A product card, normalized from the several field spellings the backend
/// emits across event kinds.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductWidget {
    /// Dedup identity. `None` means the card cannot be deduplicated and is
    /// dropped by the accumulator.
    pub product_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Widget {
    /// Interprets one raw widget value. Text widgets are tagged with either
    /// `type` or `kind`; anything else must be `type: "product"`. Unknown
    /// widget kinds are skipped.
    pub fn from_value(value: &Value) -> Option<Widget> {
        let kind = str_field(value, "type").or_else(|| str_field(value, "kind"))?;
        match kind.as_str() {
            "text" => {
                let text = str_field(value, "text")
                    .or_else(|| str_field(value, "value"))
                    .unwrap_or_default();
                Some(Widget::Text(TextWidget { text }))
            }
            "product" => Some(Widget::Product(ProductWidget::from_value(value))),
            _ => None,
        }
    }
}

impl ProductWidget {
    pub fn from_value(value: &Value) -> Self {
        let product_id = str_field(value, "productId").or_else(|| str_field(value, "id"));
        let title = str_field(value, "title")
            .or_else(|| str_field(value, "name"))
            .or_else(|| product_id.clone())
            .unwrap_or_else(|| "Product".to_string());
        Self {
            product_id,
            title,
            brand: str_field(value, "brand").or_else(|| str_field(value, "vendor")),
            image_url: image_url(value),
            score: score(value),
            description: str_field(value, "description"),
            reason: str_field(value, "reason"),
        }
    }

    /// Relevance as a displayable percentage. Heuristic: values above 1 are
    /// assumed to already be percentages, values at or below 1 are scaled
    /// x100. A backend that ever sends a legitimate 0.4% score would be
    /// displayed as 40%; there is no authoritative contract either way.
    pub fn score_percent(&self) -> Option<f64> {
        self.score.map(|s| if s > 1.0 { s } else { s * 100.0 })
    }
}

// ============================================================================
// Accumulated Result
// ============================================================================

/// What one session has gathered so far: a running summary (latest text
/// widget wins) and products in arrival order with unique non-empty ids.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AccumulatedResult {
    pub summary: String,
    pub products: Vec<ProductWidget>,
}

impl AccumulatedResult {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.products.is_empty()
    }
}

// ============================================================================
// Field Extraction Helpers
// ============================================================================

/// Non-empty trimmed string at `key`, if any.
fn str_field(value: &Value, key: &str) -> Option<String> {
    let s = value.get(key)?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// Image URL fallback chain: `image`, `imageUrl`, `metadata.imageUrl`,
/// `imagePaths[0]`, `images[0]`.
fn image_url(value: &Value) -> Option<String> {
    str_field(value, "image")
        .or_else(|| str_field(value, "imageUrl"))
        .or_else(|| value.get("metadata").and_then(|m| str_field(m, "imageUrl")))
        .or_else(|| first_str(value.get("imagePaths")))
        .or_else(|| first_str(value.get("images")))
}

fn first_str(value: Option<&Value>) -> Option<String> {
    let s = value?.as_array()?.first()?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

/// `score` falling back to `relevance`; accepts numbers and numeric strings.
fn score(value: &Value) -> Option<f64> {
    let raw = value.get("score").or_else(|| value.get("relevance"))?;
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
