use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of expression coefficients carried in every frame.
pub const BLEND_SHAPE_COUNT: usize = 51;

macro_rules! blend_shapes {
    ($($variant:ident => $name:literal,)+) => {
        /// Facial expression basis shapes, declared in canonical (alphabetical) wire order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum BlendShape {
            $($variant,)+
        }

        impl BlendShape {
            pub const ALL: [BlendShape; BLEND_SHAPE_COUNT] = [$(BlendShape::$variant,)+];

            pub fn name(self) -> &'static str {
                match self {
                    $(BlendShape::$variant => $name,)+
                }
            }
        }
    };
}

blend_shapes! {
    BrowDownLeft => "browDownLeft",
    BrowDownRight => "browDownRight",
    BrowInnerUp => "browInnerUp",
    BrowOuterUpLeft => "browOuterUpLeft",
    BrowOuterUpRight => "browOuterUpRight",
    CheekPuff => "cheekPuff",
    CheekSquintLeft => "cheekSquintLeft",
    CheekSquintRight => "cheekSquintRight",
    EyeBlinkLeft => "eyeBlinkLeft",
    EyeBlinkRight => "eyeBlinkRight",
    EyeLookDownLeft => "eyeLookDownLeft",
    EyeLookDownRight => "eyeLookDownRight",
    EyeLookInLeft => "eyeLookInLeft",
    EyeLookInRight => "eyeLookInRight",
    EyeLookOutLeft => "eyeLookOutLeft",
    EyeLookOutRight => "eyeLookOutRight",
    EyeLookUpLeft => "eyeLookUpLeft",
    EyeLookUpRight => "eyeLookUpRight",
    EyeSquintLeft => "eyeSquintLeft",
    EyeSquintRight => "eyeSquintRight",
    EyeWideLeft => "eyeWideLeft",
    EyeWideRight => "eyeWideRight",
    JawForward => "jawForward",
    JawLeft => "jawLeft",
    JawOpen => "jawOpen",
    JawRight => "jawRight",
    MouthClose => "mouthClose",
    MouthDimpleLeft => "mouthDimpleLeft",
    MouthDimpleRight => "mouthDimpleRight",
    MouthFrownLeft => "mouthFrownLeft",
    MouthFrownRight => "mouthFrownRight",
    MouthFunnel => "mouthFunnel",
    MouthLeft => "mouthLeft",
    MouthLowerDownLeft => "mouthLowerDownLeft",
    MouthLowerDownRight => "mouthLowerDownRight",
    MouthPressLeft => "mouthPressLeft",
    MouthPressRight => "mouthPressRight",
    MouthPucker => "mouthPucker",
    MouthRight => "mouthRight",
    MouthRollLower => "mouthRollLower",
    MouthRollUpper => "mouthRollUpper",
    MouthShrugLower => "mouthShrugLower",
    MouthShrugUpper => "mouthShrugUpper",
    MouthSmileLeft => "mouthSmileLeft",
    MouthSmileRight => "mouthSmileRight",
    MouthStretchLeft => "mouthStretchLeft",
    MouthStretchRight => "mouthStretchRight",
    MouthUpperUpLeft => "mouthUpperUpLeft",
    NoseSneerLeft => "noseSneerLeft",
    NoseSneerRight => "noseSneerRight",
    TongueOut => "tongueOut",
}

impl BlendShape {
    /// Position of this shape in the wire array.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BlendShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown blend shape '{0}'")]
pub struct UnknownBlendShape(pub String);

impl FromStr for BlendShape {
    type Err = UnknownBlendShape;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        BlendShape::ALL
            .iter()
            .copied()
            .find(|shape| shape.name() == name)
            .ok_or_else(|| UnknownBlendShape(name.to_string()))
    }
}

/// A complete set of expression coefficients indexed by [`BlendShape`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blendshapes([f32; BLEND_SHAPE_COUNT]);

impl Default for Blendshapes {
    fn default() -> Self {
        Self([0.0; BLEND_SHAPE_COUNT])
    }
}

impl Blendshapes {
    /// Build from a shape-keyed mapping. Every shape must be present.
    pub fn from_weights<I>(weights: I) -> Result<Self, BlendShape>
    where
        I: IntoIterator<Item = (BlendShape, f32)>,
    {
        let mut values = [0.0; BLEND_SHAPE_COUNT];
        let mut seen = [false; BLEND_SHAPE_COUNT];
        for (shape, weight) in weights {
            values[shape.index()] = weight;
            seen[shape.index()] = true;
        }
        match seen.iter().position(|present| !present) {
            Some(missing) => Err(BlendShape::ALL[missing]),
            None => Ok(Self(values)),
        }
    }

    pub(crate) fn from_array(values: [f32; BLEND_SHAPE_COUNT]) -> Self {
        Self(values)
    }

    pub fn get(&self, shape: BlendShape) -> f32 {
        self.0[shape.index()]
    }

    pub fn set(&mut self, shape: BlendShape, weight: f32) {
        self.0[shape.index()] = weight;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Shape-keyed view, in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (BlendShape, f32)> + '_ {
        BlendShape::ALL.iter().map(|shape| (*shape, self.0[shape.index()]))
    }
}
