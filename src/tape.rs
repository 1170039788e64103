//! Implementation of shared memory arena for the terms, aka a tape.
//! See https://rufflewind.com/2016-12-30/reverse-mode-automatic-differentiation
//!
//! Every arithmetic operation on a [`TapeTerm`] appends a node to the [`Tape`] with its
//! forward value already evaluated. [`TapeTerm::backprop`] then walks the nodes that the
//! root depends on in reverse topological order and accumulates gradients into them.

use std::{cell::RefCell, fmt};

use crate::error::ConstantExponentError;

#[derive(Default, Debug)]
pub struct Tape {
    nodes: RefCell<Vec<TapeNode>>,
}

#[derive(Clone, Debug)]
struct TapeNode {
    label: Option<String>,
    value: TapeValue,
    data: f64,
    grad: f64,
}

#[derive(Clone, Debug)]
struct UnaryFnPayload {
    term: u32,
    name: String,
    grad: fn(f64) -> f64,
}

#[derive(Clone, Debug)]
enum TapeValue {
    Value,
    Add(u32, u32),
    Mul(u32, u32),
    Pow(u32, f64),
    UnaryFn(UnaryFnPayload),
}

impl TapeValue {
    /// Operand handles in argument order. A node using the same operand twice yields it twice.
    fn operands(&self) -> impl DoubleEndedIterator<Item = u32> {
        use TapeValue::*;
        let (lhs, rhs) = match *self {
            Value => (None, None),
            Add(lhs, rhs) | Mul(lhs, rhs) => (Some(lhs), Some(rhs)),
            Pow(term, _) | UnaryFn(UnaryFnPayload { term, .. }) => (Some(term), None),
        };
        lhs.into_iter().chain(rhs)
    }
}

/// The operation that produced a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// A leaf created by [`Tape::term`], [`Tape::leaf`] or a promoted constant.
    Leaf,
    Add,
    Mul,
    /// Power with a constant exponent.
    Pow(f64),
    /// An element-wise function applied with [`TapeTerm::apply`], by name.
    UnaryFn(String),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Leaf => Ok(()),
            Op::Add => write!(f, "+"),
            Op::Mul => write!(f, "*"),
            Op::Pow(exp) => write!(f, "**{exp}"),
            Op::UnaryFn(name) => write!(f, "{name}"),
        }
    }
}

/// A handle to a node in a [`Tape`].
///
/// It is cheap to copy, and two handles compare equal only if they point to the same
/// node of the same tape, regardless of their values.
#[derive(Copy, Clone)]
pub struct TapeTerm<'a> {
    tape: &'a Tape,
    idx: u32,
}

/// An argument of an arithmetic operation: either an existing term or a raw number,
/// which is promoted to a fresh leaf when the operation is built.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Operand<'a> {
    Term(TapeTerm<'a>),
    Constant(f64),
}

impl<'a> From<TapeTerm<'a>> for Operand<'a> {
    fn from(term: TapeTerm<'a>) -> Self {
        Self::Term(term)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<i32> for Operand<'_> {
    fn from(value: i32) -> Self {
        Self::Constant(value as f64)
    }
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a named leaf. The name is only used for debugging.
    pub fn term<'a>(&'a self, name: impl Into<String>, init: f64) -> TapeTerm<'a> {
        self.push(Some(name.into()), TapeValue::Value, init)
    }

    /// Creates an unnamed leaf.
    pub fn leaf(&self, init: f64) -> TapeTerm<'_> {
        self.push(None, TapeValue::Value, init)
    }

    /// Number of nodes recorded so far, including promoted constants.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Resets the gradient of every node on this tape to zero.
    ///
    /// [`TapeTerm::backprop`] never does this by itself, so gradients of repeated
    /// passes add up until this is called.
    pub fn clear_grad(&self) {
        let mut nodes = self.nodes.borrow_mut();
        log::debug!("clear_grad: {} nodes", nodes.len());
        for node in nodes.iter_mut() {
            node.grad = 0.;
        }
    }

    fn push(&self, label: Option<String>, value: TapeValue, data: f64) -> TapeTerm<'_> {
        let mut nodes = self.nodes.borrow_mut();
        let idx = nodes.len();
        nodes.push(TapeNode {
            label,
            value,
            data,
            grad: 0.,
        });
        TapeTerm {
            tape: self,
            idx: idx as u32,
        }
    }

    fn push_op(&self, value: TapeValue, data: f64) -> TapeTerm<'_> {
        let label = self.expr_label(&value);
        self.push(label, value, data)
    }

    fn promote<'a>(&'a self, operand: Operand<'a>) -> TapeTerm<'a> {
        match operand {
            Operand::Term(term) => {
                debug_assert!(
                    std::ptr::eq(term.tape, self),
                    "Terms from different tapes cannot be combined"
                );
                term
            }
            Operand::Constant(value) => self.leaf(value),
        }
    }

    fn data_of(&self, idx: u32) -> f64 {
        self.nodes.borrow()[idx as usize].data
    }

    fn add<'a>(&'a self, lhs: Operand<'a>, rhs: Operand<'a>) -> TapeTerm<'a> {
        let lhs = self.promote(lhs);
        let rhs = self.promote(rhs);
        self.push_op(
            TapeValue::Add(lhs.idx, rhs.idx),
            self.data_of(lhs.idx) + self.data_of(rhs.idx),
        )
    }

    fn mul<'a>(&'a self, lhs: Operand<'a>, rhs: Operand<'a>) -> TapeTerm<'a> {
        let lhs = self.promote(lhs);
        let rhs = self.promote(rhs);
        self.push_op(
            TapeValue::Mul(lhs.idx, rhs.idx),
            self.data_of(lhs.idx) * self.data_of(rhs.idx),
        )
    }

    fn negate<'a>(&'a self, term: TapeTerm<'a>) -> TapeTerm<'a> {
        self.mul(term.into(), Operand::Constant(-1.))
    }

    /// Constants are negated numerically; terms get a `mul(_, -1)` node.
    fn negate_operand<'a>(&'a self, operand: Operand<'a>) -> Operand<'a> {
        match operand {
            Operand::Term(term) => self.negate(term).into(),
            Operand::Constant(value) => Operand::Constant(-value),
        }
    }

    fn sub<'a>(&'a self, lhs: Operand<'a>, rhs: Operand<'a>) -> TapeTerm<'a> {
        let rhs = self.negate_operand(rhs);
        self.add(lhs, rhs)
    }

    fn div<'a>(&'a self, lhs: Operand<'a>, rhs: Operand<'a>) -> TapeTerm<'a> {
        let rhs: Operand<'a> = match rhs {
            Operand::Term(term) => term.powf(-1.).into(),
            Operand::Constant(value) => Operand::Constant(value.powf(-1.)),
        };
        self.mul(lhs, rhs)
    }

    #[cfg(feature = "expr_name")]
    fn expr_label(&self, value: &TapeValue) -> Option<String> {
        use TapeValue::*;
        // Derived operands are referred to by index so labels stay bounded on long chains.
        let name = |idx: u32| {
            let nodes = self.nodes.borrow();
            let node = &nodes[idx as usize];
            match (&node.value, &node.label) {
                (Value, Some(label)) => label.clone(),
                (Value, None) => format!("{}", node.data),
                _ => format!("a{idx}"),
            }
        };
        Some(match value {
            Value => return None,
            Add(lhs, rhs) => format!("({} + {})", name(*lhs), name(*rhs)),
            Mul(lhs, rhs) => format!("{} * {}", name(*lhs), name(*rhs)),
            Pow(term, exp) => format!("{}^{}", name(*term), exp),
            UnaryFn(UnaryFnPayload { term, name: f, .. }) => format!("{}({})", f, name(*term)),
        })
    }

    #[cfg(not(feature = "expr_name"))]
    fn expr_label(&self, _value: &TapeValue) -> Option<String> {
        None
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident) => {
        impl<'a> std::ops::$trait for TapeTerm<'a> {
            type Output = Self;
            fn $method(self, rhs: Self) -> Self::Output {
                self.tape.$method(self.into(), rhs.into())
            }
        }

        impl<'a> std::ops::$trait<f64> for TapeTerm<'a> {
            type Output = Self;
            fn $method(self, rhs: f64) -> Self::Output {
                self.tape.$method(self.into(), rhs.into())
            }
        }

        impl<'a> std::ops::$trait<TapeTerm<'a>> for f64 {
            type Output = TapeTerm<'a>;
            fn $method(self, rhs: TapeTerm<'a>) -> Self::Output {
                rhs.tape.$method(self.into(), rhs.into())
            }
        }
    };
}

impl_binary_op!(Add, add);
impl_binary_op!(Sub, sub);
impl_binary_op!(Mul, mul);
impl_binary_op!(Div, div);

impl<'a> std::ops::Neg for TapeTerm<'a> {
    type Output = Self;
    fn neg(self) -> Self::Output {
        self.tape.negate(self)
    }
}

impl<'a> TapeTerm<'a> {
    /// The forward value, evaluated when this node was created.
    pub fn data(&self) -> f64 {
        self.tape.data_of(self.idx)
    }

    /// The gradient accumulated by backpropagation so far.
    pub fn grad(&self) -> f64 {
        self.tape.nodes.borrow()[self.idx as usize].grad
    }

    pub fn label(&self) -> Option<String> {
        self.tape.nodes.borrow()[self.idx as usize].label.clone()
    }

    pub fn op(&self) -> Op {
        use TapeValue::*;
        match &self.tape.nodes.borrow()[self.idx as usize].value {
            Value => Op::Leaf,
            Add(..) => Op::Add,
            Mul(..) => Op::Mul,
            Pow(_, exp) => Op::Pow(*exp),
            UnaryFn(UnaryFnPayload { name, .. }) => Op::UnaryFn(name.clone()),
        }
    }

    /// Position of this node on its tape. Operands always have smaller indices than
    /// the nodes built from them.
    pub fn index(&self) -> usize {
        self.idx as usize
    }

    /// Distinct direct operands of this node. `x * x` has a single child.
    pub fn children(&self) -> Vec<TapeTerm<'a>> {
        let nodes = self.tape.nodes.borrow();
        let mut children: Vec<TapeTerm<'a>> = vec![];
        for idx in nodes[self.idx as usize].value.operands() {
            if children.iter().all(|child| child.idx != idx) {
                children.push(TapeTerm {
                    tape: self.tape,
                    idx,
                });
            }
        }
        children
    }

    /// Raises this term to a constant power.
    ///
    /// Fails with [`ConstantExponentError`] if `exponent` is a term, without adding
    /// any node to the tape.
    pub fn pow(self, exponent: impl Into<Operand<'a>>) -> Result<Self, ConstantExponentError> {
        match exponent.into() {
            Operand::Constant(exp) => Ok(self.powf(exp)),
            Operand::Term(_) => Err(ConstantExponentError),
        }
    }

    pub fn powf(self, exp: f64) -> Self {
        self.tape
            .push_op(TapeValue::Pow(self.idx, exp), self.data().powf(exp))
    }

    pub fn exp(self) -> Self {
        self.apply("exp", f64::exp, f64::exp)
    }

    pub fn ln(self) -> Self {
        self.apply("ln", f64::ln, |x| 1. / x)
    }

    pub fn tanh(self) -> Self {
        self.apply("tanh", f64::tanh, |x| 1. - x.tanh().powi(2))
    }

    pub fn relu(self) -> Self {
        self.apply(
            "relu",
            |x| if x < 0. { 0. } else { x },
            |x| if x > 0. { 1. } else { 0. },
        )
    }

    /// Applies an element-wise function `f` whose derivative is `grad`.
    pub fn apply(
        self,
        name: &(impl AsRef<str> + ?Sized),
        f: fn(f64) -> f64,
        grad: fn(f64) -> f64,
    ) -> Self {
        self.tape.push_op(
            TapeValue::UnaryFn(UnaryFnPayload {
                term: self.idx,
                name: name.as_ref().to_string(),
                grad,
            }),
            f(self.data()),
        )
    }

    /// Backpropagates from this term to every node it depends on.
    ///
    /// The gradient of this term is set to 1 and the local rule of every node reachable
    /// from it runs exactly once, consumers before their operands. Gradients of other
    /// nodes are not reset beforehand, so calling this twice accumulates; use
    /// [`Tape::clear_grad`] in between to start over.
    ///
    /// The tape must be acyclic, which holds for any graph built through this API.
    pub fn backprop(&self) {
        let mut nodes = self.tape.nodes.borrow_mut();
        let order = topological_order(&nodes, self.idx);
        log::debug!(
            "backprop from a{}: {} nodes in topological order",
            self.idx,
            order.len()
        );
        nodes[self.idx as usize].grad = 1.;
        for &idx in order.iter().rev() {
            backward(&mut nodes, idx);
        }
    }
}

/// Post-order depth-first traversal from `root`, children before parents, root last.
/// Uses an explicit stack so that deep chains do not exhaust the call stack.
fn topological_order(nodes: &[TapeNode], root: u32) -> Vec<u32> {
    let mut visited = vec![false; nodes.len()];
    let mut order = vec![];
    let mut stack = vec![(root, false)];
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            order.push(idx);
            continue;
        }
        if visited[idx as usize] {
            continue;
        }
        visited[idx as usize] = true;
        stack.push((idx, true));
        // Reversed so that the first operand is visited first.
        for child in nodes[idx as usize].value.operands().rev() {
            if !visited[child as usize] {
                stack.push((child, false));
            }
        }
    }
    order
}

/// Runs the local rule of node `idx`, adding its contribution to each operand's gradient.
fn backward(nodes: &mut [TapeNode], idx: u32) {
    use TapeValue::*;
    let node = &nodes[idx as usize];
    let out = node.grad;
    let (first, second) = match node.value {
        Value => return,
        Add(lhs, rhs) => ((lhs, out), Some((rhs, out))),
        Mul(lhs, rhs) => (
            (lhs, nodes[rhs as usize].data * out),
            Some((rhs, nodes[lhs as usize].data * out)),
        ),
        Pow(term, exp) => (
            (term, exp * nodes[term as usize].data.powf(exp - 1.) * out),
            None,
        ),
        UnaryFn(UnaryFnPayload { term, grad, .. }) => {
            ((term, grad(nodes[term as usize].data) * out), None)
        }
    };
    log::trace!("backward a{idx}: {first:?} {second:?}");
    for (child, delta) in std::iter::once(first).chain(second) {
        nodes[child as usize].grad += delta;
    }
}

impl PartialEq for TapeTerm<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tape, other.tape) && self.idx == other.idx
    }
}

impl Eq for TapeTerm<'_> {}

impl fmt::Display for TapeTerm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(data={}, grad={})", self.data(), self.grad())
    }
}

impl fmt::Debug for TapeTerm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.tape.nodes.borrow();
        let node = &nodes[self.idx as usize];
        f.debug_struct("TapeTerm")
            .field("idx", &self.idx)
            .field("label", &node.label)
            .field("value", &node.value)
            .field("data", &node.data)
            .field("grad", &node.grad)
            .finish()
    }
}
