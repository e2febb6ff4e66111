use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classifier threshold applied to the raw P(no fracture) score.
pub const FRACTURE_THRESHOLD: f64 = 0.5;

/// Verified identity handed over by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input of one pipeline run.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub image: Bytes,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "fractured")]
    Fractured,
    #[serde(rename = "not fractured")]
    NotFractured,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Fractured => "fractured",
            Label::NotFractured => "not fractured",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fractured" => Ok(Label::Fractured),
            "not fractured" => Ok(Label::NotFractured),
            other => Err(format!("unknown label {:?}", other)),
        }
    }
}

/// Classifier outcome.
///
/// `raw_score` is what the network emits, P(no fracture). The label is derived from
/// the raw score (`raw < 0.5` means fractured) while callers only ever see the
/// inverted `fracture_probability`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub raw_score: f64,
    pub fracture_probability: f64,
}

impl Classification {
    pub fn from_raw(raw_score: f64) -> Self {
        Self {
            raw_score,
            fracture_probability: 1.0 - raw_score,
        }
    }

    pub fn label(&self) -> Label {
        if self.raw_score < FRACTURE_THRESHOLD {
            Label::Fractured
        } else {
            Label::NotFractured
        }
    }

    /// Fracture probability rounded to 4 decimal places.
    pub fn confidence(&self) -> f64 {
        round4(self.fracture_probability)
    }
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Axis-aligned box in source-image pixels, serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let inter = BoundingBox::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        )
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f64; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Which branch the pipeline took after classification and detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    NotFractured,
    FracturedNoBox,
    FracturedWithBoxes {
        primary: BoundingBox,
        rest: Vec<BoundingBox>,
    },
}

impl Finding {
    /// Branch for a positive classification, given the detector output in emission order.
    pub fn fractured(boxes: Vec<BoundingBox>) -> Self {
        let mut boxes = boxes.into_iter();
        match boxes.next() {
            Some(primary) => Finding::FracturedWithBoxes {
                primary,
                rest: boxes.collect(),
            },
            None => Finding::FracturedNoBox,
        }
    }

    pub fn label(&self) -> Label {
        match self {
            Finding::NotFractured => Label::NotFractured,
            Finding::FracturedNoBox | Finding::FracturedWithBoxes { .. } => Label::Fractured,
        }
    }

    pub fn boxes(&self) -> Vec<BoundingBox> {
        match self {
            Finding::NotFractured | Finding::FracturedNoBox => Vec::new(),
            Finding::FracturedWithBoxes { primary, rest } => {
                std::iter::once(*primary).chain(rest.iter().copied()).collect()
            }
        }
    }
}

/// Record appended to the persistence gateway once per successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrediction {
    pub user_id: UserId,
    pub image_filename: String,
    pub label: Label,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: i64,
    pub user_id: UserId,
    pub image_filename: String,
    pub label: Label,
    pub confidence: f64,
    pub created_at: time::OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub label: Label,
    pub confidence: f64,
    pub boxes: Vec<BoundingBox>,
    pub annotated_image_url: Option<String>,
    pub report: Option<String>,
}
