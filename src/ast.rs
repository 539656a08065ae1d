//! Abstract Syntax Tree definitions for tensor expressions

use serde::{Deserialize, Serialize};

use crate::config::WordSize;

/// Expression types produced by the parser
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Scalar literal
    Number(f64),

    /// Variable reference
    Variable(String),

    /// Tensor literal: `[[1, 2], [3, 4]]`
    Tensor(TensorLiteral),

    /// Binary arithmetic: `a + b`, `W @ X`, `A # F`
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operators: `-a`, `relu(a)`, `argmax(a)`, `A.T`
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Table-approximated function: `tanh(x)`, `sigmoid(x)`, `exp(x)`
    Nonlinear { func: Nonlinear, arg: Box<Expr> },

    /// Input declaration: `let X : (4, 1) in [-1.0, 1.0] in body`
    Input {
        name: String,
        shape: Shape,
        width: Option<WordSize>,
        range: (f64, f64),
        body: Box<Expr>,
    },

    /// Let binding: `let x = value in body`
    Let {
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
    },

    /// Sign test: `p >= 0 ? a : b`
    Cond {
        predicate: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },

    /// Statically bounded fold: `for i in [0:4] fold acc = init in body`
    Loop {
        index: String,
        start: usize,
        end: usize,
        acc: String,
        init: Box<Expr>,
        body: Box<Expr>,
    },

    /// Function definition: `def f(x: (4, 1)) = body in rest`
    FuncDef {
        name: String,
        params: Vec<(String, Shape)>,
        body: Box<Expr>,
        rest: Box<Expr>,
    },

    /// Call of a user-defined function
    FuncCall { name: String, args: Vec<Expr> },

    /// `reshape(A, (r, c))`
    Reshape { operand: Box<Expr>, shape: Shape },

    /// `A[i]`
    Index { operand: Box<Expr>, index: Box<Expr> },
}

impl Expr {
    /// Short label used to identify a node in diagnostics
    pub fn label(&self) -> String {
        match self {
            Expr::Number(n) => format!("{}", n),
            Expr::Variable(name) => name.clone(),
            Expr::Tensor(lit) => format!("tensor literal {}", lit.shape),
            Expr::Binary { op, left, right } => {
                format!("{} {} {}", left.label(), op, right.label())
            }
            Expr::Unary { op, operand } => format!("{}({})", op, operand.label()),
            Expr::Nonlinear { func, arg } => format!("{}({})", func, arg.label()),
            Expr::Input { name, .. } => format!("input {}", name),
            Expr::Let { name, .. } => format!("let {}", name),
            Expr::Cond { predicate, .. } => format!("{} >= 0 ? ..", predicate.label()),
            Expr::Loop { index, acc, .. } => format!("for {} fold {}", index, acc),
            Expr::FuncDef { name, .. } => format!("def {}", name),
            Expr::FuncCall { name, .. } => format!("{}(..)", name),
            Expr::Reshape { operand, shape } => format!("reshape({}, {})", operand.label(), shape),
            Expr::Index { operand, index } => format!("{}[{}]", operand.label(), index.label()),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    /// Elementwise or scalar-broadcast multiplication `*`
    Mul,
    /// Matrix product `@`
    MatMul,
    /// Valid 2-D convolution `#`
    Conv,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::MatMul => write!(f, "@"),
            BinaryOp::Conv => write!(f, "#"),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Relu,
    ArgMax,
    Transpose,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Relu => write!(f, "relu"),
            UnaryOp::ArgMax => write!(f, "argmax"),
            UnaryOp::Transpose => write!(f, "transpose"),
        }
    }
}

/// Nonlinear functions approximated with lookup tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Nonlinear {
    Tanh,
    Sigmoid,
    Exp,
}

impl Nonlinear {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tanh" => Some(Nonlinear::Tanh),
            "sigmoid" => Some(Nonlinear::Sigmoid),
            "exp" => Some(Nonlinear::Exp),
            _ => None,
        }
    }

    /// Evaluate the function in real arithmetic
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            Nonlinear::Tanh => x.tanh(),
            Nonlinear::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Nonlinear::Exp => x.exp(),
        }
    }

    /// Domain outside of which the function is treated as saturated
    pub fn saturation(&self) -> Option<(f64, f64)> {
        match self {
            Nonlinear::Tanh | Nonlinear::Sigmoid => Some((-8.0, 8.0)),
            Nonlinear::Exp => None,
        }
    }
}

impl std::fmt::Display for Nonlinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Nonlinear::Tanh => write!(f, "tanh"),
            Nonlinear::Sigmoid => write!(f, "sigmoid"),
            Nonlinear::Exp => write!(f, "exp"),
        }
    }
}

/// A tensor literal value, stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub shape: Shape,
    pub values: Vec<f64>,
}

impl TensorLiteral {
    pub fn new(shape: Shape, values: Vec<f64>) -> Self {
        Self { shape, values }
    }
}

/// Shape of a value: `()` for scalars, otherwise the dimensions in row-major order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    /// `(rows, cols)` of a 2-D shape
    pub fn matrix(&self) -> Option<(usize, usize)> {
        match self.0.as_slice() {
            [rows, cols] => Some((*rows, *cols)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "()"),
            [n] => write!(f, "({},)", n),
            dims => {
                let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Element kind of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Scalar,
    Tensor,
}

/// Semantic type attached to every node after inference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type {
    pub shape: Shape,
    /// Declared storage width, when narrower than the target word
    pub width: Option<WordSize>,
}

impl Type {
    pub fn scalar() -> Self {
        Self {
            shape: Shape::scalar(),
            width: None,
        }
    }

    pub fn tensor(dims: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: Shape::new(dims),
            width: None,
        }
    }

    pub fn of(shape: Shape) -> Self {
        Self { shape, width: None }
    }

    pub fn kind(&self) -> Kind {
        if self.shape.is_scalar() {
            Kind::Scalar
        } else {
            Kind::Tensor
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.kind() == Kind::Scalar
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.width {
            Some(width) => write!(f, "{} as {}", self.shape, width),
            None => write!(f, "{}", self.shape),
        }
    }
}

/// Typed expression with inferred shape information
#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub expr: TypedExprKind,
    pub ty: Type,
}

/// A function body typed at its definition site
#[derive(Debug, Clone, PartialEq)]
pub struct TypedFunction {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub body: TypedExpr,
}

/// Typed expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    Number(f64),
    Variable(String),
    Tensor(Vec<f64>),
    Binary {
        op: BinaryOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    Nonlinear {
        func: Nonlinear,
        arg: Box<TypedExpr>,
    },
    Input {
        name: String,
        ty: Type,
        range: (f64, f64),
        body: Box<TypedExpr>,
    },
    Let {
        name: String,
        value: Box<TypedExpr>,
        body: Box<TypedExpr>,
    },
    Cond {
        predicate: Box<TypedExpr>,
        then_branch: Box<TypedExpr>,
        else_branch: Box<TypedExpr>,
    },
    Loop {
        index: String,
        start: usize,
        end: usize,
        acc: String,
        init: Box<TypedExpr>,
        body: Box<TypedExpr>,
    },
    FuncDef {
        func: Box<TypedFunction>,
        rest: Box<TypedExpr>,
    },
    FuncCall {
        name: String,
        args: Vec<TypedExpr>,
    },
    Reshape {
        operand: Box<TypedExpr>,
    },
    Index {
        operand: Box<TypedExpr>,
        index: Box<TypedExpr>,
    },
}
