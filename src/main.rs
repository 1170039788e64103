use scalograd::{ConstantExponentError, Tape};

fn main() -> Result<(), ConstantExponentError> {
    env_logger::init();

    println!("f(x, y) = x^2 * y + y + 2 at x = 3, y = 4");
    let tape = Tape::new();
    let x = tape.term("x", 3.);
    let y = tape.term("y", 4.);
    let x_squared = x.pow(2)?;
    let term1 = x_squared * y;
    let term2 = term1 + y;
    let f = term2 + 2.;
    println!("f = {}", f.data());

    f.backprop();
    println!("df/dx = {} (2xy = 24)", x.grad());
    println!("df/dy = {} (x^2 + 1 = 10)", y.grad());

    println!();
    println!("g(a, b) = (a + b) * (a - b) at a = 5, b = 3");
    let tape = Tape::new();
    let a = tape.term("a", 5.);
    let b = tape.term("b", 3.);
    let g = (a + b) * (a - b);
    println!("g = {}", g.data());

    g.backprop();
    println!("dg/da = {} (2a = 10)", a.grad());
    println!("dg/db = {} (-2b = -6)", b.grad());
    Ok(())
}
