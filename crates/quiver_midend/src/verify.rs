//! Structural checks run on every function a pass produces.

use crate::error::Error;
use quiver_common::data::typed_ir::{Expr, ExprKind, MergeMap, Stmt, TypeEnv, TypedFn, VarName};
use quiver_common::data::types::{Type, BOOL};
use std::collections::BTreeSet;

struct Verifier<'a> {
    env: &'a TypeEnv,
    defined: BTreeSet<VarName>,
}

impl<'a> Verifier<'a> {
    fn define(&mut self, name: &VarName, actual: &Type) -> Result<(), Error> {
        if !self.defined.insert(name.clone()) {
            return Err(Error::Redefinition(name.clone()));
        }
        let declared = self
            .env
            .get(name)
            .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
        if declared != actual {
            return Err(Error::DeclarationMismatch {
                name: name.clone(),
                declared: declared.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }

    fn check_cond(&self, cond: &Expr) -> Result<(), Error> {
        if cond.type_ != BOOL {
            return Err(Error::TypeMismatch {
                context: "branch condition",
                expected: BOOL,
                actual: cond.type_.clone(),
            });
        }
        Ok(())
    }

    fn check_merge(&mut self, merge: &MergeMap) -> Result<(), Error> {
        for (name, (left, right)) in merge {
            let declared = self
                .env
                .get(name)
                .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
            if &left.type_ != declared || &right.type_ != declared {
                return Err(Error::MergeTypeMismatch {
                    name: name.clone(),
                    declared: declared.clone(),
                    left: left.type_.clone(),
                    right: right.type_.clone(),
                });
            }
            if !self.defined.insert(name.clone()) {
                return Err(Error::Redefinition(name.clone()));
            }
        }
        Ok(())
    }

    fn check_block(&mut self, block: &[Stmt]) -> Result<(), Error> {
        block.iter().try_for_each(|stmt| self.check_stmt(stmt))
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<(), Error> {
        match stmt {
            Stmt::Assign(lhs, rhs) => match &lhs.kind {
                ExprKind::Var(name) => {
                    if lhs.type_ != rhs.type_ {
                        return Err(Error::DeclarationMismatch {
                            name: name.clone(),
                            declared: lhs.type_.clone(),
                            actual: rhs.type_.clone(),
                        });
                    }
                    self.define(name, &rhs.type_)
                }
                ExprKind::Index(_, _) => Ok(()),
                _ => Err(Error::TypeMismatch {
                    context: "assignment target",
                    expected: rhs.type_.clone(),
                    actual: lhs.type_.clone(),
                }),
            },
            Stmt::Return(_) => Ok(()),
            Stmt::If(if_) => {
                self.check_cond(&if_.cond)?;
                self.check_block(&if_.true_block)?;
                self.check_block(&if_.false_block)?;
                self.check_merge(&if_.merge)
            }
            Stmt::While(while_) => {
                self.check_merge(&while_.merge)?;
                self.check_cond(&while_.cond)?;
                self.check_block(&while_.body)
            }
            Stmt::ForLoop(for_loop) => {
                for bound in [&for_loop.start, &for_loop.stop, &for_loop.step] {
                    if !bound.type_.as_scalar().map_or(false, |t| t.is_int()) {
                        return Err(Error::TypeMismatch {
                            context: "loop bound",
                            expected: for_loop.start.type_.clone(),
                            actual: bound.type_.clone(),
                        });
                    }
                }
                self.define(&for_loop.var, &for_loop.start.type_)?;
                self.check_merge(&for_loop.merge)?;
                self.check_block(&for_loop.body)
            }
        }
    }
}

/// Checks that every name is defined exactly once with its declared type, that merges join values
/// of the merged name's type, and that conditions and loop bounds are well-typed.
pub fn verify(func: &TypedFn) -> Result<(), Error> {
    let mut verifier = Verifier {
        env: &func.type_env,
        defined: BTreeSet::new(),
    };
    for (name, type_) in func.arg_names.iter().zip(&func.input_types) {
        verifier.define(name, type_)?;
    }
    verifier.check_block(&func.body)
}
