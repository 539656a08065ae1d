//! Type analyzer for inferring tensor shapes
//!
//! Performs shape inference and type checking on the AST. Every node of the
//! result carries a [`Type`]; any shape conflict aborts the compilation.

use std::collections::HashMap;

use crate::ast::*;
use crate::error::{CompileError, CompileResult};

/// Signature of a user-defined function
#[derive(Debug, Clone)]
struct Signature {
    params: Vec<Type>,
    ret: Type,
}

/// Analyzer for type checking and shape inference
pub struct Analyzer {
    /// Types of the names currently in scope
    env: HashMap<String, Type>,
    /// Functions currently in scope
    funcs: HashMap<String, Signature>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            env: HashMap::new(),
            funcs: HashMap::new(),
        }
    }

    /// Analyze a program and produce the typed AST
    pub fn analyze(&mut self, program: &Expr) -> CompileResult<TypedExpr> {
        self.analyze_expr(program)
    }

    /// Run `f` with `name` bound to `ty`, restoring any shadowed binding afterwards
    fn with_binding<T>(
        &mut self,
        name: &str,
        ty: Type,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let shadowed = self.env.insert(name.to_string(), ty);
        let result = f(self);
        match shadowed {
            Some(prev) => self.env.insert(name.to_string(), prev),
            None => self.env.remove(name),
        };
        result
    }

    /// Analyze an expression and infer its type
    fn analyze_expr(&mut self, expr: &Expr) -> CompileResult<TypedExpr> {
        match expr {
            Expr::Number(n) => Ok(TypedExpr {
                expr: TypedExprKind::Number(*n),
                ty: Type::scalar(),
            }),

            Expr::Variable(name) => {
                let ty = self
                    .env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CompileError::undeclared(name))?;

                Ok(TypedExpr {
                    expr: TypedExprKind::Variable(name.clone()),
                    ty,
                })
            }

            Expr::Tensor(lit) => Ok(TypedExpr {
                expr: TypedExprKind::Tensor(lit.values.clone()),
                ty: Type::of(lit.shape.clone()),
            }),

            Expr::Binary { op, left, right } => {
                let left_typed = self.analyze_expr(left)?;
                let right_typed = self.analyze_expr(right)?;
                let shape = self.binary_shape(expr, *op, &left_typed.ty.shape, &right_typed.ty.shape)?;

                Ok(TypedExpr {
                    expr: TypedExprKind::Binary {
                        op: *op,
                        left: Box::new(left_typed),
                        right: Box::new(right_typed),
                    },
                    ty: Type::of(shape),
                })
            }

            Expr::Unary { op, operand } => {
                let operand_typed = self.analyze_expr(operand)?;
                let shape = &operand_typed.ty.shape;

                let shape = match op {
                    UnaryOp::Neg | UnaryOp::Relu => shape.clone(),
                    UnaryOp::ArgMax => {
                        if shape.is_scalar() {
                            return Err(CompileError::type_error(format!(
                                "argmax requires a tensor operand in `{}`",
                                expr.label()
                            )));
                        }
                        Shape::scalar()
                    }
                    UnaryOp::Transpose => match shape.matrix() {
                        Some((rows, cols)) => Shape::new([cols, rows]),
                        None => {
                            return Err(CompileError::type_error(format!(
                                "transpose requires a 2-D operand, got {} in `{}`",
                                shape,
                                expr.label()
                            )))
                        }
                    },
                };

                Ok(TypedExpr {
                    expr: TypedExprKind::Unary {
                        op: *op,
                        operand: Box::new(operand_typed),
                    },
                    ty: Type::of(shape),
                })
            }

            Expr::Nonlinear { func, arg } => {
                let arg_typed = self.analyze_expr(arg)?;
                let ty = Type::of(arg_typed.ty.shape.clone());

                Ok(TypedExpr {
                    expr: TypedExprKind::Nonlinear {
                        func: *func,
                        arg: Box::new(arg_typed),
                    },
                    ty,
                })
            }

            Expr::Input {
                name,
                shape,
                width,
                range,
                body,
            } => {
                let ty = Type {
                    shape: shape.clone(),
                    width: *width,
                };
                let body_typed = self.with_binding(name, ty.clone(), |a| a.analyze_expr(body))?;
                let result_ty = body_typed.ty.clone();

                Ok(TypedExpr {
                    expr: TypedExprKind::Input {
                        name: name.clone(),
                        ty,
                        range: *range,
                        body: Box::new(body_typed),
                    },
                    ty: result_ty,
                })
            }

            Expr::Let { name, value, body } => {
                let value_typed = self.analyze_expr(value)?;
                let body_typed =
                    self.with_binding(name, value_typed.ty.clone(), |a| a.analyze_expr(body))?;
                let ty = body_typed.ty.clone();

                Ok(TypedExpr {
                    expr: TypedExprKind::Let {
                        name: name.clone(),
                        value: Box::new(value_typed),
                        body: Box::new(body_typed),
                    },
                    ty,
                })
            }

            Expr::Cond {
                predicate,
                then_branch,
                else_branch,
            } => {
                let predicate_typed = self.analyze_expr(predicate)?;
                if !predicate_typed.ty.is_scalar() {
                    return Err(CompileError::type_error(format!(
                        "condition must be a scalar, got {} in `{}`",
                        predicate_typed.ty.shape,
                        expr.label()
                    )));
                }

                let then_typed = self.analyze_expr(then_branch)?;
                let else_typed = self.analyze_expr(else_branch)?;
                if then_typed.ty.shape != else_typed.ty.shape {
                    return Err(CompileError::shape_mismatch(
                        expr.label(),
                        &then_typed.ty.shape,
                        &else_typed.ty.shape,
                    ));
                }
                let ty = Type::of(then_typed.ty.shape.clone());

                Ok(TypedExpr {
                    expr: TypedExprKind::Cond {
                        predicate: Box::new(predicate_typed),
                        then_branch: Box::new(then_typed),
                        else_branch: Box::new(else_typed),
                    },
                    ty,
                })
            }

            Expr::Loop {
                index,
                start,
                end,
                acc,
                init,
                body,
            } => {
                let init_typed = self.analyze_expr(init)?;
                let acc_ty = Type::of(init_typed.ty.shape.clone());

                let body_typed = self.with_binding(acc, acc_ty.clone(), |a| {
                    a.with_binding(index, Type::scalar(), |a| a.analyze_expr(body))
                })?;

                if body_typed.ty.shape != acc_ty.shape {
                    return Err(CompileError::shape_mismatch(
                        expr.label(),
                        &acc_ty.shape,
                        &body_typed.ty.shape,
                    ));
                }

                Ok(TypedExpr {
                    expr: TypedExprKind::Loop {
                        index: index.clone(),
                        start: *start,
                        end: *end,
                        acc: acc.clone(),
                        init: Box::new(init_typed),
                        body: Box::new(body_typed),
                    },
                    ty: acc_ty,
                })
            }

            Expr::FuncDef {
                name,
                params,
                body,
                rest,
            } => self.analyze_func_def(name, params, body, rest),

            Expr::FuncCall { name, args } => self.analyze_func_call(expr, name, args),

            Expr::Reshape { operand, shape } => {
                let operand_typed = self.analyze_expr(operand)?;
                if operand_typed.ty.is_scalar() || shape.is_scalar() {
                    return Err(CompileError::type_error(format!(
                        "reshape works on tensors only in `{}`",
                        expr.label()
                    )));
                }
                if operand_typed.ty.shape.len() != shape.len() {
                    return Err(CompileError::shape_mismatch(
                        expr.label(),
                        &operand_typed.ty.shape,
                        shape,
                    ));
                }

                Ok(TypedExpr {
                    expr: TypedExprKind::Reshape {
                        operand: Box::new(operand_typed),
                    },
                    ty: Type::of(shape.clone()),
                })
            }

            Expr::Index { operand, index } => {
                let operand_typed = self.analyze_expr(operand)?;
                let index_typed = self.analyze_expr(index)?;

                let dims = operand_typed.ty.shape.dims().to_vec();
                let Some((&leading, rest)) = dims.split_first() else {
                    return Err(CompileError::type_error(format!(
                        "cannot index a scalar in `{}`",
                        expr.label()
                    )));
                };

                if !index_typed.ty.is_scalar() {
                    return Err(CompileError::type_error(format!(
                        "index must be a scalar in `{}`",
                        expr.label()
                    )));
                }

                if let TypedExprKind::Number(n) = index_typed.expr {
                    if n.fract() != 0.0 || n < 0.0 || n as usize >= leading {
                        return Err(CompileError::type_error(format!(
                            "index {} out of bounds for leading dimension {} in `{}`",
                            n,
                            leading,
                            expr.label()
                        )));
                    }
                }

                Ok(TypedExpr {
                    expr: TypedExprKind::Index {
                        operand: Box::new(operand_typed),
                        index: Box::new(index_typed),
                    },
                    ty: Type::tensor(rest.to_vec()),
                })
            }
        }
    }

    /// Result shape of a binary operator
    fn binary_shape(
        &self,
        node: &Expr,
        op: BinaryOp,
        left: &Shape,
        right: &Shape,
    ) -> CompileResult<Shape> {
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                self.check_broadcast_compatible(node, left, right)
            }

            BinaryOp::MatMul => match (left.matrix(), right.matrix()) {
                (Some((m, k1)), Some((k2, n))) => {
                    if k1 != k2 {
                        return Err(CompileError::shape_mismatch(node.label(), left, right));
                    }
                    Ok(Shape::new([m, n]))
                }
                _ => Err(CompileError::type_error(format!(
                    "matrix product requires 2-D operands, got {} and {} in `{}`",
                    left,
                    right,
                    node.label()
                ))),
            },

            BinaryOp::Conv => match (left.matrix(), right.matrix()) {
                (Some((h, w)), Some((kh, kw))) => {
                    if kh > h || kw > w {
                        return Err(CompileError::shape_mismatch(node.label(), left, right));
                    }
                    Ok(Shape::new([h - kh + 1, w - kw + 1]))
                }
                _ => Err(CompileError::type_error(format!(
                    "convolution requires 2-D operands, got {} and {} in `{}`",
                    left,
                    right,
                    node.label()
                ))),
            },
        }
    }

    /// Check if two shapes are broadcast compatible
    fn check_broadcast_compatible(
        &self,
        node: &Expr,
        left: &Shape,
        right: &Shape,
    ) -> CompileResult<Shape> {
        if left.is_scalar() {
            Ok(right.clone())
        } else if right.is_scalar() || left == right {
            Ok(left.clone())
        } else {
            Err(CompileError::shape_mismatch(node.label(), left, right))
        }
    }

    fn analyze_func_def(
        &mut self,
        name: &str,
        params: &[(String, Shape)],
        body: &Expr,
        rest: &Expr,
    ) -> CompileResult<TypedExpr> {
        for (i, (param, _)) in params.iter().enumerate() {
            if params[..i].iter().any(|(other, _)| other == param) {
                return Err(CompileError::type_error(format!(
                    "duplicate parameter `{}` in `def {}`",
                    param, name
                )));
            }
        }

        let param_types: Vec<(String, Type)> = params
            .iter()
            .map(|(param, shape)| (param.clone(), Type::of(shape.clone())))
            .collect();

        // Parameters shadow outer names for the duration of the body
        let shadowed: Vec<(String, Option<Type>)> = param_types
            .iter()
            .map(|(param, ty)| (param.clone(), self.env.insert(param.clone(), ty.clone())))
            .collect();
        let body_result = self.analyze_expr(body);
        for (param, prev) in shadowed.into_iter().rev() {
            match prev {
                Some(prev) => self.env.insert(param, prev),
                None => self.env.remove(&param),
            };
        }
        let body_typed = body_result?;

        let signature = Signature {
            params: param_types.iter().map(|(_, ty)| ty.clone()).collect(),
            ret: Type::of(body_typed.ty.shape.clone()),
        };

        let shadowed_func = self.funcs.insert(name.to_string(), signature);
        let rest_result = self.analyze_expr(rest);
        match shadowed_func {
            Some(prev) => self.funcs.insert(name.to_string(), prev),
            None => self.funcs.remove(name),
        };
        let rest_typed = rest_result?;
        let ty = rest_typed.ty.clone();

        Ok(TypedExpr {
            expr: TypedExprKind::FuncDef {
                func: Box::new(TypedFunction {
                    name: name.to_string(),
                    params: param_types,
                    body: body_typed,
                }),
                rest: Box::new(rest_typed),
            },
            ty,
        })
    }

    fn analyze_func_call(
        &mut self,
        node: &Expr,
        name: &str,
        args: &[Expr],
    ) -> CompileResult<TypedExpr> {
        let signature = self
            .funcs
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::undeclared(name))?;

        if signature.params.len() != args.len() {
            return Err(CompileError::type_error(format!(
                "{} expects {} argument(s), got {}",
                name,
                signature.params.len(),
                args.len()
            )));
        }

        let mut typed_args = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(&signature.params) {
            let arg_typed = self.analyze_expr(arg)?;
            if arg_typed.ty.shape != param.shape {
                return Err(CompileError::shape_mismatch(
                    node.label(),
                    &param.shape,
                    &arg_typed.ty.shape,
                ));
            }
            typed_args.push(arg_typed);
        }

        Ok(TypedExpr {
            expr: TypedExprKind::FuncCall {
                name: name.to_string(),
                args: typed_args,
            },
            ty: signature.ret,
        })
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn infer(source: &str) -> CompileResult<TypedExpr> {
        Analyzer::new().analyze(&parse(source).unwrap())
    }

    #[test]
    fn test_analyze_matmul() {
        let typed = infer("let W : (3, 4) in [-1, 1] in let X : (4, 1) in [0, 1] in W @ X").unwrap();
        assert_eq!(typed.ty.shape, Shape::new([3, 1]));
    }

    #[test]
    fn test_analyze_matmul_error() {
        let err = infer("let W : (3, 4) in [-1, 1] in let X : (3, 1) in [0, 1] in W @ X")
            .unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_broadcast_and_mismatch() {
        let typed = infer("let X : (2, 2) in [0, 1] in X * 2 + 1").unwrap();
        assert_eq!(typed.ty.shape, Shape::new([2, 2]));

        let err = infer("let X : (2, 2) in [0, 1] in let Y : (2, 1) in [0, 1] in X + Y")
            .unwrap_err();
        match err {
            CompileError::ShapeMismatch { node, left, right } => {
                assert_eq!(node, "X + Y");
                assert_eq!(left, Shape::new([2, 2]));
                assert_eq!(right, Shape::new([2, 1]));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_literal_shapes() {
        assert!(infer("3").unwrap().ty.is_scalar());
        assert_eq!(infer("[[1, 2, 3], [4, 5, 6]]").unwrap().ty.shape, Shape::new([2, 3]));
    }

    #[test]
    fn test_nonlinear_keeps_shape() {
        let typed = infer("let X : (5,) in [-2, 2] in sigmoid(X)").unwrap();
        assert_eq!(typed.ty.shape, Shape::new([5]));
    }

    #[test]
    fn test_convolution_shape() {
        let typed = infer("let A : (5, 6) in [0, 1] in A # [[1, 0], [0, 1]]").unwrap();
        assert_eq!(typed.ty.shape, Shape::new([4, 5]));
    }

    #[test]
    fn test_let_scope_ends_with_body() {
        let err = infer("(let a = 1 in a) + a").unwrap_err();
        assert!(matches!(err, CompileError::UndeclaredVariable { name } if name == "a"));
    }

    #[test]
    fn test_let_propagates_type() {
        let typed = infer("let X : (2, 3) in [0, 1] in let y = X.T in y").unwrap();
        assert_eq!(typed.ty.shape, Shape::new([3, 2]));
    }

    #[test]
    fn test_function_call_shapes_checked() {
        let ok = infer("let X : (2, 1) in [0, 1] in def f(x: (2, 1)) = relu(x) in f(X)").unwrap();
        assert_eq!(ok.ty.shape, Shape::new([2, 1]));

        let err = infer("let X : (3, 1) in [0, 1] in def f(x: (2, 1)) = relu(x) in f(X)")
            .unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_function_not_visible_in_own_body() {
        let err = infer("def f(x: ()) = f(x) in f(1)").unwrap_err();
        assert!(matches!(err, CompileError::UndeclaredVariable { name } if name == "f"));
    }

    #[test]
    fn test_loop_body_must_match_accumulator() {
        let ok = infer("let X : (4,) in [0, 1] in for i in [0:4] fold s = 0 in s + X[i]").unwrap();
        assert!(ok.ty.is_scalar());

        let err = infer("let X : (4,) in [0, 1] in for i in [0:4] fold s = 0 in s + X").unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_index_bounds_checked() {
        let row = infer("let X : (3, 2) in [0, 1] in X[2]").unwrap();
        assert_eq!(row.ty.shape, Shape::new([2]));
        assert!(infer("let X : (3, 2) in [0, 1] in X[3]").is_err());
    }

    #[test]
    fn test_condition_requires_scalar_predicate() {
        let err = infer("let X : (2,) in [0, 1] in X >= 0 ? 1 : 2").unwrap_err();
        assert!(matches!(err, CompileError::TypeError { .. }));
    }

    #[test]
    fn test_reshape_requires_same_length() {
        assert!(infer("let X : (2, 3) in [0, 1] in reshape(X, (3, 2))").is_ok());
        assert!(infer("let X : (2, 3) in [0, 1] in reshape(X, (4, 2))").is_err());
    }
}
