//! Wire format for face frames carried over the data channel.
//!
//! A frame is a JSON array of exactly four float arrays:
//! `[blendshapes(51), face(4), leftEye(4), rightEye(4)]`. Quaternions are `x, y, z, w`.
//! There is no version field; both ends rely on the canonical ordering in [`BlendShape::ALL`].

use bytes::Bytes;
use thiserror::Error;

mod blendshape;

pub use blendshape::{BLEND_SHAPE_COUNT, BlendShape, Blendshapes, UnknownBlendShape};

const QUATERNION_LEN: usize = 4;
const ARRAY_COUNT: usize = 4;
const ARRAY_LENGTHS: [usize; ARRAY_COUNT] =
    [BLEND_SHAPE_COUNT, QUATERNION_LEN, QUATERNION_LEN, QUATERNION_LEN];
const ARRAY_NAMES: [&str; ARRAY_COUNT] = ["blendshapes", "face", "leftEye", "rightEye"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn to_array(self) -> [f32; QUATERNION_LEN] {
        [self.x, self.y, self.z, self.w]
    }

    fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [x, y, z, w] => Some(Self::new(*x, *y, *z, *w)),
            _ => None,
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// One captured pose: expression coefficients plus face and eye orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceFrame {
    pub blendshapes: Blendshapes,
    pub face: Quaternion,
    pub left_eye: Quaternion,
    pub right_eye: Quaternion,
}

impl FaceFrame {
    pub fn new(
        blendshapes: Blendshapes,
        face: Quaternion,
        left_eye: Quaternion,
        right_eye: Quaternion,
    ) -> Self {
        Self {
            blendshapes,
            face,
            left_eye,
            right_eye,
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no coefficient supplied for {0}")]
    MissingCoefficient(BlendShape),
    #[error("{array}[{index}] is not a finite number")]
    NonFinite { array: &'static str, index: usize },
    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not an array of float arrays: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {ARRAY_COUNT} arrays, found {found}")]
    WrongArrayCount { found: usize },
    #[error("{array} has {found} values, expected {expected}")]
    WrongLength {
        array: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{array}[{index}] is not a finite number")]
    NonFinite { array: &'static str, index: usize },
}

/// Encode a frame from a shape-keyed coefficient mapping and three orientations.
pub fn encode_weights<I>(
    weights: I,
    face: Quaternion,
    left_eye: Quaternion,
    right_eye: Quaternion,
) -> Result<Bytes, EncodeError>
where
    I: IntoIterator<Item = (BlendShape, f32)>,
{
    let blendshapes = Blendshapes::from_weights(weights).map_err(EncodeError::MissingCoefficient)?;
    encode(&FaceFrame::new(blendshapes, face, left_eye, right_eye))
}

pub fn encode(frame: &FaceFrame) -> Result<Bytes, EncodeError> {
    let face = frame.face.to_array();
    let left_eye = frame.left_eye.to_array();
    let right_eye = frame.right_eye.to_array();
    let arrays: [&[f32]; ARRAY_COUNT] = [frame.blendshapes.as_slice(), &face, &left_eye, &right_eye];

    for (array, values) in ARRAY_NAMES.into_iter().zip(arrays.iter()) {
        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(EncodeError::NonFinite { array, index });
        }
    }
    Ok(Bytes::from(serde_json::to_vec(&arrays)?))
}

pub fn decode(payload: &[u8]) -> Result<FaceFrame, DecodeError> {
    let arrays: Vec<Vec<f32>> = serde_json::from_slice(payload)?;
    if arrays.len() != ARRAY_COUNT {
        return Err(DecodeError::WrongArrayCount {
            found: arrays.len(),
        });
    }
    for ((values, expected), array) in arrays.iter().zip(ARRAY_LENGTHS).zip(ARRAY_NAMES) {
        if values.len() != expected {
            return Err(DecodeError::WrongLength {
                array,
                expected,
                found: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(DecodeError::NonFinite { array, index });
        }
    }

    let mut coefficients = [0.0; BLEND_SHAPE_COUNT];
    coefficients.copy_from_slice(&arrays[0]);
    let quaternion = |index: usize| {
        Quaternion::from_slice(&arrays[index]).ok_or(DecodeError::WrongLength {
            array: ARRAY_NAMES[index],
            expected: QUATERNION_LEN,
            found: arrays[index].len(),
        })
    };
    Ok(FaceFrame {
        blendshapes: Blendshapes::from_array(coefficients),
        face: quaternion(1)?,
        left_eye: quaternion(2)?,
        right_eye: quaternion(3)?,
    })
}
