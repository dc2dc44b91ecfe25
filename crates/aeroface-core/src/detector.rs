//! SCRFD face detector via ONNX Runtime.
//!
//! Decodes the image, letterboxes it to 640×640, runs the 3-stride
//! anchor-free head and applies NMS. Each surviving face is returned with
//! its crop and its five landmarks normalized to the source image.

use crate::perception::{DetectedFace, DetectionError, FaceDetection};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Letterbox scale and padding, for mapping back to source pixels.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let target = SCRFD_INPUT_SIZE as f32;
        let scale = (target / width as f32).min(target / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target - new_w) / 2.0).floor(),
            pad_y: ((target - new_h) / 2.0).floor(),
        }
    }

    fn to_source(self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// A decoded detection in source pixel coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Option<[(f32, f32); 5]>,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Per-stride (score, bbox, kps) output tensor indices.
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectionError> {
        if !Path::new(model_path).exists() {
            return Err(DetectionError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?names, "loaded SCRFD model");

        if names.len() < 9 {
            return Err(DetectionError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        Ok(Self {
            session,
            stride_outputs: output_layout(&names),
        })
    }

    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let lb = Letterbox::fit(image.width(), image.height());
        let new_w = ((image.width() as f32 * lb.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((image.height() as f32 * lb.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Pad with the mean so padding normalizes to 0.0
        let pad = SCRFD_MEAN.round() as u8;
        let mut canvas =
            RgbImage::from_pixel(SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE, Rgb([pad, pad, pad]));
        imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

        let size = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
        (tensor, lb)
    }

    fn run(&mut self, image: &RgbImage) -> Result<Vec<Candidate>, DetectionError> {
        let (input, lb) = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| {
                        DetectionError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            candidates.extend(decode_stride(&scores, &bboxes, &kps, stride, lb));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetection for FaceDetector {
    fn detect(&mut self, bytes: &[u8]) -> Result<Vec<DetectedFace>, DetectionError> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(DetectionError::InferenceFailed("image has no pixels".into()));
        }

        let candidates = self.run(&image)?;
        tracing::debug!(faces = candidates.len(), width = w, height = h, "SCRFD detection");

        Ok(candidates
            .into_iter()
            .filter_map(|c| to_detected_face(&image, &c))
            .collect())
    }
}

/// Crop the candidate out of the source and normalize its landmarks.
/// Returns `None` when the box lies entirely outside the image.
fn to_detected_face(image: &RgbImage, c: &Candidate) -> Option<DetectedFace> {
    let (w, h) = image.dimensions();
    let x1 = c.x1.max(0.0).floor() as u32;
    let y1 = c.y1.max(0.0).floor() as u32;
    let x2 = (c.x2.min(w as f32).ceil() as u32).min(w);
    let y2 = (c.y2.min(h as f32).ceil() as u32).min(h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop = imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image();
    let landmarks = c
        .landmarks
        .map(|lms| lms.iter().map(|&(x, y)| (x / w as f32, y / h as f32)).collect())
        .unwrap_or_default();

    Some(DetectedFace {
        crop,
        landmarks,
        confidence: c.score,
    })
}

/// Map output tensors to stride slots.
///
/// Exports that name tensors "score_8", "bbox_16", ... are mapped by name;
/// anything else uses the standard positional order [scores, bboxes, kps].
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        names
            .iter()
            .position(|n| *n == format!("{prefix}_{stride}"))
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::debug!(layout = ?v, "SCRFD: name-based output mapping");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::debug!("SCRFD: positional output mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: Letterbox,
) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let b = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = lb.to_source(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = lb.to_source(ax + b[2] * s, ay + b[3] * s);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| lb.to_source(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(Candidate { x1, y1, x2, y2, score, landmarks })
        })
        .collect()
}

/// Greedy non-maximum suppression; output sorted by descending score.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| k.iou(&c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}
