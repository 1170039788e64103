//! Scalar reverse-mode automatic differentiation on a tape.
//!
//! ```
//! use scalograd::Tape;
//!
//! let tape = Tape::new();
//! let x = tape.term("x", 3.);
//! let y = tape.term("y", 4.);
//! let f = x.powf(2.) * y + y + 2.;
//! f.backprop();
//! assert_eq!(f.data(), 42.);
//! assert_eq!(x.grad(), 24.);
//! assert_eq!(y.grad(), 10.);
//! ```

pub mod error;
pub mod tape;

pub use error::ConstantExponentError;
pub use tape::{Op, Operand, Tape, TapeTerm};
