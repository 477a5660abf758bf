//! A small language for deriving output variables from input variables.
//!
//! A program is a sequence of assignments, one per line or separated by
//! semicolons:
//!
//! ```text
//! NOX = NO + NO2
//! O3 = O3 * 1000   # ppm to ppb
//! RATIO = max(NO2, 0.01) / (NOX + 1e-6)
//! ```
//!
//! Supported are the binary operators `+ - * /` and `**` (or `^`) for
//! powers, unary minus, parentheses, numeric literals, and the functions
//! `abs`, `sqrt`, `exp`, `log`, `log10` (one argument) and `min`, `max`
//! (two or more arguments, elementwise). Only names already in the
//! namespace or assigned earlier in the program can be read; there is no
//! other access to the host.
//!
//! Before evaluation, a program can report which names it reads from the
//! outside ([`ExprProgram::used_names`]) and which it writes
//! ([`ExprProgram::assigned_names`]). The pipeline uses the first to decide
//! what to extract from model files and the second to decide what to write.
use indexmap::{IndexMap, IndexSet};
use ndarray::{ArrayD, Zip};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "expr/expr.pest"]
struct ExprParser;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExprError {
    #[error("Syntax error in expression:\n{0}")]
    Syntax(String),
    #[error("at character {index}, '{name}' is not one of the allowed functions")]
    UnknownFunction { name: String, index: usize },
    #[error("function {name} takes {expected} argument(s), got {got}")]
    WrongArgCount { name: String, expected: String, got: usize },
    #[error("'{0}' is not defined")]
    UndefinedName(String),
    #[error("cannot combine arrays of shape {lhs:?} and {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

impl ExprError {
    fn unknown_function<S: Into<String>>(name: S, span: pest::Span) -> Self {
        Self::UnknownFunction { name: name.into(), index: span.start() }
    }

    fn wrong_arg_count<S: Into<String>>(name: S, expected: &str, got: usize) -> Self {
        Self::WrongArgCount { name: name.into(), expected: expected.to_string(), got }
    }
}

/// A value in an expression namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array(ArrayD<f64>),
}

impl Value {
    fn map<F: Fn(f64) -> f64>(self, f: F) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(f(v)),
            Value::Array(a) => Value::Array(a.mapv_into(f)),
        }
    }

    fn zip_with<F: Fn(f64, f64) -> f64>(self, other: Value, f: F) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
            (Value::Array(a), Value::Scalar(b)) => Ok(Value::Array(a.mapv_into(|x| f(x, b)))),
            (Value::Scalar(a), Value::Array(b)) => Ok(Value::Array(b.mapv_into(|y| f(a, y)))),
            (Value::Array(a), Value::Array(b)) => {
                if a.shape() != b.shape() {
                    return Err(ExprError::ShapeMismatch { lhs: a.shape().to_vec(), rhs: b.shape().to_vec() });
                }
                Ok(Value::Array(Zip::from(&a).and(&b).map_collect(|x, y| f(*x, *y))))
            }
        }
    }

    /// Expand to an array of `shape` (scalars are broadcast).
    pub fn into_array(self, shape: &[usize]) -> Result<ArrayD<f64>, ExprError> {
        match self {
            Value::Scalar(v) => Ok(ArrayD::from_elem(shape, v)),
            Value::Array(a) if a.shape() == shape => Ok(a),
            Value::Array(a) => Err(ExprError::ShapeMismatch { lhs: a.shape().to_vec(), rhs: shape.to_vec() }),
        }
    }
}

/// Named values an expression reads from and writes to.
pub type Namespace = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
enum Func {
    Abs,
    Sqrt,
    Exp,
    Log,
    Log10,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Name(String),
    Neg(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { func: Func, args: Vec<Expr> },
}

impl Expr {
    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Name(n) => names.push(n),
            Expr::Neg(e) => e.collect_names(names),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_names(names)),
        }
    }

    fn eval(&self, ns: &Namespace) -> Result<Value, ExprError> {
        match self {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Name(n) => ns.get(n).cloned().ok_or_else(|| ExprError::UndefinedName(n.clone())),
            Expr::Neg(e) => Ok(e.eval(ns)?.map(|v| -v)),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = lhs.eval(ns)?;
                let rhs = rhs.eval(ns)?;
                match op {
                    BinOp::Add => lhs.zip_with(rhs, |a, b| a + b),
                    BinOp::Sub => lhs.zip_with(rhs, |a, b| a - b),
                    BinOp::Mul => lhs.zip_with(rhs, |a, b| a * b),
                    BinOp::Div => lhs.zip_with(rhs, |a, b| a / b),
                    BinOp::Pow => lhs.zip_with(rhs, f64::powf),
                }
            }
            Expr::Call { func, args } => {
                let mut args = args.iter().map(|a| a.eval(ns));
                // Argument counts were checked at parse time
                let first = args.next().ok_or_else(|| ExprError::wrong_arg_count(format!("{func:?}"), "at least 1", 0))??;
                match func {
                    Func::Abs => Ok(first.map(f64::abs)),
                    Func::Sqrt => Ok(first.map(f64::sqrt)),
                    Func::Exp => Ok(first.map(f64::exp)),
                    Func::Log => Ok(first.map(f64::ln)),
                    Func::Log10 => Ok(first.map(f64::log10)),
                    Func::Min => args.try_fold(first, |acc, v| acc.zip_with(v?, f64::min)),
                    Func::Max => args.try_fold(first, |acc, v| acc.zip_with(v?, f64::max)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Statement {
    target: String,
    expr: Expr,
}

/// A parsed derived-variable program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExprProgram {
    statements: Vec<Statement>,
}

impl ExprProgram {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let program = ExprParser::parse(Rule::program, source)
            .map_err(|e| ExprError::Syntax(e.to_string()))?
            .next()
            .ok_or_else(|| ExprError::Syntax("empty parse".to_string()))?;

        let pratt = pratt_parser();
        let mut statements = vec![];
        for pair in program.into_inner() {
            match pair.as_rule() {
                Rule::statement => statements.push(build_statement(pair, &pratt)?),
                Rule::EOI => {}
                r => unreachable!("unexpected rule at program level: {r:?}"),
            }
        }
        Ok(Self { statements })
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Names read from the namespace before the program assigns them, in
    /// order of first use.
    pub fn used_names(&self) -> IndexSet<String> {
        let mut assigned: IndexSet<&str> = IndexSet::new();
        let mut used = IndexSet::new();
        for stmt in self.statements.iter() {
            let mut names = vec![];
            stmt.expr.collect_names(&mut names);
            for n in names {
                if !assigned.contains(n) {
                    used.insert(n.to_string());
                }
            }
            assigned.insert(&stmt.target);
        }
        used
    }

    /// Names the program writes, in order of first assignment.
    pub fn assigned_names(&self) -> IndexSet<String> {
        self.statements.iter().map(|s| s.target.clone()).collect()
    }

    /// Run every statement in order, storing each result in `ns`.
    pub fn eval(&self, ns: &mut Namespace) -> Result<(), ExprError> {
        for stmt in self.statements.iter() {
            let value = stmt.expr.eval(ns)?;
            ns.insert(stmt.target.clone(), value);
        }
        Ok(())
    }
}

fn pratt_parser() -> PrattParser<Rule> {
    // Lowest precedence first. Negation binds looser than powers, so -2**2 == -4.
    PrattParser::new()
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
        .op(Op::prefix(Rule::neg))
        .op(Op::infix(Rule::pow, Assoc::Right))
}

fn build_statement(pair: Pair<'_, Rule>, pratt: &PrattParser<Rule>) -> Result<Statement, ExprError> {
    let mut inner = pair.into_inner();
    // The grammar guarantees a statement is an identifier followed by an expression
    let target = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
    let expr = match inner.next() {
        Some(e) => build_expr(e.into_inner(), pratt)?,
        None => return Err(ExprError::Syntax(format!("missing expression for {target}"))),
    };
    Ok(Statement { target, expr })
}

fn build_expr(pairs: Pairs<'_, Rule>, pratt: &PrattParser<Rule>) -> Result<Expr, ExprError> {
    pratt
        .map_primary(|primary| build_primary(primary, pratt))
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::neg => Ok(Expr::Neg(Box::new(rhs?))),
            r => unreachable!("unexpected prefix operator {r:?}"),
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::pow => BinOp::Pow,
                r => unreachable!("unexpected infix operator {r:?}"),
            };
            Ok(Expr::Binary { op, lhs: Box::new(lhs?), rhs: Box::new(rhs?) })
        })
        .parse(pairs)
}

fn build_primary(pair: Pair<'_, Rule>, pratt: &PrattParser<Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse()
            .map(Expr::Number)
            .map_err(|_| ExprError::Syntax(format!("invalid number '{}'", pair.as_str()))),
        Rule::ident => Ok(Expr::Name(pair.as_str().to_string())),
        Rule::expr => build_expr(pair.into_inner(), pratt),
        Rule::call => {
            let mut inner = pair.into_inner();
            let Some(name) = inner.next() else {
                return Err(ExprError::Syntax("function call without a name".to_string()));
            };
            let func: Func = name
                .as_str()
                .parse()
                .map_err(|_| ExprError::unknown_function(name.as_str(), name.as_span()))?;
            let args = inner
                .map(|a| build_expr(a.into_inner(), pratt))
                .collect::<Result<Vec<_>, _>>()?;
            check_arity(func, name.as_str(), args.len())?;
            Ok(Expr::Call { func, args })
        }
        r => unreachable!("unexpected primary rule {r:?}"),
    }
}

fn check_arity(func: Func, name: &str, n: usize) -> Result<(), ExprError> {
    match func {
        Func::Min | Func::Max if n < 2 => Err(ExprError::wrong_arg_count(name, "at least 2", n)),
        Func::Min | Func::Max => Ok(()),
        _ if n != 1 => Err(ExprError::wrong_arg_count(name, "1", n)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, IxDyn};
    use rstest::rstest;

    use super::*;

    fn scalar(src: &str) -> f64 {
        let prog = ExprProgram::parse(&format!("out = {src}")).unwrap();
        let mut ns = Namespace::new();
        prog.eval(&mut ns).unwrap();
        match ns["out"] {
            Value::Scalar(v) => v,
            _ => panic!("expected a scalar"),
        }
    }

    #[rstest]
    #[case("1 + 2 * 3", 7.0)]
    #[case("(1 + 2) * 3", 9.0)]
    #[case("2 ** 3 ** 2", 512.0)]
    #[case("-2 ** 2", -4.0)]
    #[case("2^3", 8.0)]
    #[case("10 - 4 - 3", 3.0)]
    #[case("1.5e2 / .5", 300.0)]
    #[case("max(1, 5, 3) - min(4, 2)", 3.0)]
    #[case("sqrt(abs(-16)) + log10(100)", 6.0)]
    fn test_arithmetic(#[case] src: &str, #[case] expected: f64) {
        assert_abs_diff_eq!(scalar(src), expected);
    }

    #[test]
    fn test_read_write_sets() {
        let prog = ExprProgram::parse(
            "# convert and combine\n\
             O3 = O3 * 1000\n\
             NOX = NO + NO2; RATIO = NO2 / NOX\n\
             \n",
        )
        .unwrap();
        let used: Vec<_> = prog.used_names().into_iter().collect();
        assert_eq!(used, vec!["O3", "NO", "NO2"]);
        let assigned: Vec<_> = prog.assigned_names().into_iter().collect();
        assert_eq!(assigned, vec!["O3", "NOX", "RATIO"]);
    }

    #[test]
    fn test_empty_program() {
        let prog = ExprProgram::parse("  \n# nothing here\n").unwrap();
        assert!(prog.is_empty());
        assert!(prog.used_names().is_empty());
    }

    #[test]
    fn test_array_eval() {
        let prog = ExprProgram::parse("NOX = NO + NO2\nPPB = NOX * 1000").unwrap();
        let mut ns = Namespace::new();
        ns.insert("NO".into(), Value::Array(arr1(&[0.001, 0.002]).into_dyn()));
        ns.insert("NO2".into(), Value::Array(arr1(&[0.003, f64::NAN]).into_dyn()));
        prog.eval(&mut ns).unwrap();
        let Value::Array(ppb) = &ns["PPB"] else { panic!("expected an array") };
        assert_abs_diff_eq!(ppb[[0]], 4.0, epsilon = 1e-12);
        assert!(ppb[[1]].is_nan());
    }

    #[test]
    fn test_scalar_broadcast() {
        let v = Value::Scalar(2.0).into_array(&[2, 3]).unwrap();
        assert_eq!(v.shape(), &[2, 3]);
        assert_eq!(v[IxDyn(&[1, 2])], 2.0);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(ExprProgram::parse("O3 = (1 + "), Err(ExprError::Syntax(_))));
        assert!(matches!(ExprProgram::parse("O3 + 1"), Err(ExprError::Syntax(_))));
        assert_eq!(
            ExprProgram::parse("x = system(1)").unwrap_err(),
            ExprError::UnknownFunction { name: "system".into(), index: 4 }
        );
        assert!(matches!(ExprProgram::parse("x = max(1)"), Err(ExprError::WrongArgCount { .. })));

        let prog = ExprProgram::parse("x = y + 1").unwrap();
        assert_eq!(prog.eval(&mut Namespace::new()).unwrap_err(), ExprError::UndefinedName("y".into()));

        let prog = ExprProgram::parse("x = a + b").unwrap();
        let mut ns = Namespace::new();
        ns.insert("a".into(), Value::Array(arr1(&[1.0, 2.0]).into_dyn()));
        ns.insert("b".into(), Value::Array(arr1(&[1.0, 2.0, 3.0]).into_dyn()));
        assert!(matches!(prog.eval(&mut ns), Err(ExprError::ShapeMismatch { .. })));
    }
}
