//! Collective-variable descriptors and the tagged value variant they produce.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Discriminant of a [`Value`] without its payload.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ValueKind {
    /// A single real number.
    Scalar,
    /// A vector in three dimensions.
    Vec3,
    /// A normalized vector in three dimensions.
    Unit3,
    /// The derivative of a normalized three-vector.
    Unit3Deriv,
    /// A rotation quaternion.
    Quaternion,
    /// The derivative of a rotation quaternion.
    QuaternionDeriv,
    /// A dense one-dimensional vector of arbitrary length.
    Vec1d,
}

/// One collective-variable value.
///
/// All arithmetic needed by the bias reduces to the squared-distance metric
/// `dist2`, its left gradient `dist2_lgrad` and the uniform scale/accumulate
/// operations below, so the variants stay plain data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Value {
    /// A single real number.
    Scalar(f64),
    /// A vector in three dimensions.
    Vec3([f64; 3]),
    /// A normalized vector in three dimensions.
    Unit3([f64; 3]),
    /// The derivative of a normalized three-vector.
    Unit3Deriv([f64; 3]),
    /// A rotation quaternion, `(w, x, y, z)`.
    Quaternion([f64; 4]),
    /// The derivative of a rotation quaternion.
    QuaternionDeriv([f64; 4]),
    /// A dense one-dimensional vector of arbitrary length.
    Vec1d(Vec<f64>),
}

impl Value {
    /// Returns the zero element of `kind`; `len` is only read for
    /// [`ValueKind::Vec1d`].
    #[must_use]
    pub fn zero(kind: ValueKind, len: usize) -> Self {
        match kind {
            ValueKind::Scalar => Self::Scalar(0.0),
            ValueKind::Vec3 => Self::Vec3([0.0; 3]),
            ValueKind::Unit3 => Self::Unit3([0.0; 3]),
            ValueKind::Unit3Deriv => Self::Unit3Deriv([0.0; 3]),
            ValueKind::Quaternion => Self::Quaternion([0.0; 4]),
            ValueKind::QuaternionDeriv => Self::QuaternionDeriv([0.0; 4]),
            ValueKind::Vec1d => Self::Vec1d(vec![0.0; len]),
        }
    }

    /// Reassembles a value of `kind` from its flat components.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the component count does not match `kind`.
    pub fn from_components(kind: ValueKind, components: &[f64]) -> Result<Self> {
        let mut value = Self::zero(kind, components.len());
        if value.components().len() == components.len() {
            value.components_mut().copy_from_slice(components);
            Ok(value)
        } else {
            Err(Error::Parse(format!(
                "expected {} components, found {}",
                value.components().len(),
                components.len()
            )))
        }
    }

    /// The discriminant of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Scalar(_) => ValueKind::Scalar,
            Self::Vec3(_) => ValueKind::Vec3,
            Self::Unit3(_) => ValueKind::Unit3,
            Self::Unit3Deriv(_) => ValueKind::Unit3Deriv,
            Self::Quaternion(_) => ValueKind::Quaternion,
            Self::QuaternionDeriv(_) => ValueKind::QuaternionDeriv,
            Self::Vec1d(_) => ValueKind::Vec1d,
        }
    }

    /// Flat view of the components, in declaration order.
    #[must_use]
    pub fn components(&self) -> &[f64] {
        match self {
            Self::Scalar(x) => std::slice::from_ref(x),
            Self::Vec3(v) | Self::Unit3(v) | Self::Unit3Deriv(v) => v,
            Self::Quaternion(q) | Self::QuaternionDeriv(q) => q,
            Self::Vec1d(v) => v,
        }
    }

    fn components_mut(&mut self) -> &mut [f64] {
        match self {
            Self::Scalar(x) => std::slice::from_mut(x),
            Self::Vec3(v) | Self::Unit3(v) | Self::Unit3Deriv(v) => v,
            Self::Quaternion(q) | Self::QuaternionDeriv(q) => q,
            Self::Vec1d(v) => v,
        }
    }

    /// The payload of a scalar value.
    ///
    /// # Errors
    ///
    /// Returns a bug error for any other variant; grids only ever see scalar
    /// collective variables.
    pub fn as_scalar(&self) -> Result<f64> {
        match self {
            Self::Scalar(x) => Ok(*x),
            _ => Err(Error::Bug(format!(
                "scalar value required, found {:?}",
                self.kind()
            ))),
        }
    }

    /// Returns `self` multiplied by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let mut result = self.clone();
        for x in result.components_mut() {
            *x *= factor;
        }
        result
    }

    /// Accumulates `factor * other` into `self`.
    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        debug_assert_eq!(self.kind(), other.kind());
        for (lhs, rhs) in self.components_mut().iter_mut().zip(other.components()) {
            *lhs += factor * rhs;
        }
    }

    /// Squared distance between `self` and `other` under the flat metric of
    /// the variant. Quaternions are compared double-cover aware: the smaller
    /// of `|a-b|^2` and `|a+b|^2` is returned.
    #[must_use]
    pub fn dist2(&self, other: &Self) -> f64 {
        debug_assert_eq!(self.kind(), other.kind());
        match (self, other) {
            (Self::Quaternion(a), Self::Quaternion(b)) => {
                f64::min(quadrance(a, b, -1.0), quadrance(a, b, 1.0))
            }
            _ => self
                .components()
                .iter()
                .zip(other.components())
                .map(|(a, b)| (a - b) * (a - b))
                .sum(),
        }
    }

    /// Gradient of [`Self::dist2`] with respect to `self`.
    #[must_use]
    pub fn dist2_lgrad(&self, other: &Self) -> Self {
        debug_assert_eq!(self.kind(), other.kind());
        if let (Self::Quaternion(a), Self::Quaternion(b)) = (self, other) {
            // the gradient follows whichever cover is closer
            let sign: f64 = if quadrance(a, b, -1.0) <= quadrance(a, b, 1.0) {
                -1.0
            } else {
                1.0
            };
            let mut grad = [0.0; 4];
            for (g, (x, y)) in grad.iter_mut().zip(a.iter().zip(b)) {
                *g = 2.0 * sign.mul_add(*y, *x);
            }
            return Self::Quaternion(grad);
        }
        let mut grad = self.clone();
        for (g, b) in grad.components_mut().iter_mut().zip(other.components()) {
            *g = 2.0 * (*g - b);
        }
        grad
    }
}

fn quadrance(a: &[f64; 4], b: &[f64; 4], sign: f64) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = sign.mul_add(*y, *x);
            d * d
        })
        .sum()
}

/// Descriptor of one collective variable, as provided by the CV layer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Colvar {
    name: String,
    kind: ValueKind,
    vector_size: usize,
    width: f64,
    lower_boundary: f64,
    upper_boundary: f64,
    periodic: bool,
    expand_boundaries: bool,
    hard_lower_boundary: bool,
    hard_upper_boundary: bool,
}

impl Colvar {
    /// Constructs a scalar collective variable with the given bin spacing and
    /// boundaries.
    ///
    /// # Errors
    ///
    /// Returns an input error if `width` is not positive or the boundaries
    /// are not ordered.
    pub fn scalar(name: &str, width: f64, lower: f64, upper: f64) -> Result<Self> {
        if width <= 0.0 {
            return Err(Error::Input(format!(
                "colvar {name}: width must be positive"
            )));
        }
        if lower >= upper {
            return Err(Error::Input(format!(
                "colvar {name}: lower boundary must be below the upper boundary"
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            kind: ValueKind::Scalar,
            vector_size: 1,
            width,
            lower_boundary: lower,
            upper_boundary: upper,
            periodic: false,
            expand_boundaries: false,
            hard_lower_boundary: false,
            hard_upper_boundary: false,
        })
    }

    /// Constructs a periodic scalar collective variable; the period is
    /// `upper - lower`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::scalar`].
    pub fn periodic(name: &str, width: f64, lower: f64, upper: f64) -> Result<Self> {
        let mut cv = Self::scalar(name, width, lower, upper)?;
        cv.periodic = true;
        Ok(cv)
    }

    /// Constructs a non-scalar collective variable. Such variables carry no
    /// boundaries and cannot be gridded.
    ///
    /// # Errors
    ///
    /// Returns an input error if `width` is not positive.
    pub fn non_scalar(name: &str, kind: ValueKind, vector_size: usize, width: f64) -> Result<Self> {
        if width <= 0.0 {
            return Err(Error::Input(format!(
                "colvar {name}: width must be positive"
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            kind,
            vector_size,
            width,
            lower_boundary: 0.0,
            upper_boundary: 0.0,
            periodic: false,
            expand_boundaries: false,
            hard_lower_boundary: false,
            hard_upper_boundary: false,
        })
    }

    /// Allows the grids to grow past the configured boundaries.
    pub fn set_expand_boundaries(&mut self, expand: bool) {
        self.expand_boundaries = expand;
    }

    /// Marks boundaries that expansion must never move.
    pub fn set_hard_boundaries(&mut self, lower: bool, upper: bool) {
        self.hard_lower_boundary = lower;
        self.hard_upper_boundary = upper;
    }

    /// The name of this collective variable.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value variant this collective variable produces.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Number of flat components of one value.
    #[must_use]
    pub fn num_components(&self) -> usize {
        Value::zero(self.kind, self.vector_size).components().len()
    }

    /// The requested bin spacing.
    #[must_use]
    pub const fn width(&self) -> f64 {
        self.width
    }

    /// The lower grid boundary.
    #[must_use]
    pub const fn lower_boundary(&self) -> f64 {
        self.lower_boundary
    }

    /// The upper grid boundary.
    #[must_use]
    pub const fn upper_boundary(&self) -> f64 {
        self.upper_boundary
    }

    /// Whether the variable wraps around its period.
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// The period of a periodic variable.
    #[must_use]
    pub fn period(&self) -> f64 {
        self.upper_boundary - self.lower_boundary
    }

    /// Whether grids over this variable may grow past the boundaries.
    #[must_use]
    pub const fn expand_boundaries(&self) -> bool {
        self.expand_boundaries
    }

    /// Whether the lower boundary must never move.
    #[must_use]
    pub const fn hard_lower_boundary(&self) -> bool {
        self.hard_lower_boundary
    }

    /// Whether the upper boundary must never move.
    #[must_use]
    pub const fn hard_upper_boundary(&self) -> bool {
        self.hard_upper_boundary
    }

    /// Squared distance between two values of this variable, respecting the
    /// period for periodic scalars.
    #[must_use]
    pub fn dist2(&self, a: &Value, b: &Value) -> f64 {
        if self.periodic {
            let delta = self.wrapped_delta(a, b);
            return delta * delta;
        }
        a.dist2(b)
    }

    /// Gradient of [`Self::dist2`] with respect to `a`.
    #[must_use]
    pub fn dist2_lgrad(&self, a: &Value, b: &Value) -> Value {
        if self.periodic {
            return Value::Scalar(2.0 * self.wrapped_delta(a, b));
        }
        a.dist2_lgrad(b)
    }

    fn wrapped_delta(&self, a: &Value, b: &Value) -> f64 {
        debug_assert_eq!(a.kind(), ValueKind::Scalar);
        let period = self.period();
        let mut delta = (a.components()[0] - b.components()[0]) % period;
        if delta >= 0.5 * period {
            delta -= period;
        } else if delta < -0.5 * period {
            delta += period;
        }
        delta
    }
}
