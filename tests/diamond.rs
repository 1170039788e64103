//! Dependency graphs in diamond shape. The same term is reached through more than one
//! path, so its derivative should add up.

use scalograd::Tape;

#[test]
fn shared_leaf() {
    let tape = Tape::new();
    let a = tape.term("a", 1.);
    let b = tape.term("b", 3.);
    let c = tape.term("c", 5.);
    let ab = a + b;
    let ac = a + c;
    let abac = ab + ac;

    abac.backprop();
    assert_eq!(abac.data(), 10.);
    assert_eq!(a.grad(), 2.);
    assert_eq!(b.grad(), 1.);
    assert_eq!(c.grad(), 1.);
}

#[test]
fn shared_intermediate() {
    let tape = Tape::new();
    let a = tape.term("a", 2.);
    let a2 = -a;
    let b = tape.term("b", 3.);
    let c = tape.term("c", 5.);
    let ab = a2 + b;
    let ac = a2 * c;
    let abac = ab * ac;

    // abac = (b - a) * (-a * c) = (a^2 - a * b) * c
    abac.backprop();
    assert_eq!(abac.data(), (-2. + 3.) * (-2. * 5.));
    assert_eq!(ab.grad(), ac.data());
    assert_eq!(ac.grad(), ab.data());
    assert_eq!(a.grad(), (2. * 2. - 3.) * 5.);
    assert_eq!(a2.grad(), -a.grad());
}

#[test]
fn square_sums_both_operand_positions() {
    let tape = Tape::new();
    let x = tape.term("x", -1.5);
    let c = x * x;
    c.backprop();
    assert_eq!(x.grad(), 2. * x.data());
    assert_eq!(c.children().len(), 1);
}
