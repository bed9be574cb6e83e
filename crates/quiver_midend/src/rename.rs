use crate::builder::Builder;
use crate::error::Error;
use crate::transform::{walk_expr, Transform};
use quiver_common::data::typed_ir::{Expr, ExprKind, TypeEnv, VarName};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct Renamer {
    // Types of the names being copied, which need not live in the builder's environment
    source_env: TypeEnv,
    pub renames: BTreeMap<VarName, Expr>,
}

impl Renamer {
    pub fn new(source_env: TypeEnv) -> Self {
        Self::with_renames(source_env, BTreeMap::new())
    }

    pub fn with_renames(source_env: TypeEnv, renames: BTreeMap<VarName, Expr>) -> Self {
        Renamer {
            source_env,
            renames,
        }
    }

    /// Substitutes `value` for every later reference to `name`.
    pub fn bind(&mut self, name: VarName, value: Expr) {
        self.renames.insert(name, value);
    }

    /// Declares a fresh copy of `name` in the builder and redirects later references to it.
    pub fn rename_binding(
        &mut self,
        b: &mut Builder<'_>,
        name: &VarName,
    ) -> Result<VarName, Error> {
        let type_ = self
            .source_env
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
        let fresh = b.fresh_name(&name.0);
        let var = b.declare(fresh.clone(), type_);
        self.renames.insert(name.clone(), var);
        Ok(fresh)
    }
}

impl Transform for Renamer {
    fn cache_key(&self) -> String {
        "rename".to_owned()
    }

    fn transform_expr(&mut self, b: &mut Builder<'_>, expr: &Expr) -> Result<Expr, Error> {
        match &expr.kind {
            ExprKind::Var(name) => Ok(self
                .renames
                .get(name)
                .cloned()
                .unwrap_or_else(|| expr.clone())),
            _ => walk_expr(self, b, expr),
        }
    }

    fn transform_lhs(&mut self, b: &mut Builder<'_>, lhs: &Expr) -> Result<Expr, Error> {
        match &lhs.kind {
            ExprKind::Var(name) => {
                let fresh = self.rename_binding(b, name)?;
                Ok(Expr::var(fresh, lhs.type_.clone()))
            }
            _ => self.transform_expr(b, lhs),
        }
    }

    fn transform_binding(
        &mut self,
        b: &mut Builder<'_>,
        name: &VarName,
    ) -> Result<VarName, Error> {
        self.rename_binding(b, name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::Session;
    use quiver_common::data::prims::Prim;
    use quiver_common::data::typed_ir::{ForLoop, MergeMap, Stmt};
    use quiver_common::data::types::INT64;

    fn v(name: &str) -> Expr {
        Expr::var(VarName(name.into()), INT64)
    }

    #[test]
    fn copies_get_fresh_names_and_consistent_references() {
        let env: TypeEnv = ["x", "y", "acc", "acc_after", "i", "n"]
            .iter()
            .map(|name| (VarName((*name).into()), INT64))
            .collect();
        let mut merge = MergeMap::new();
        merge.insert(VarName("acc".into()), (v("x"), v("acc_after")));
        let body = vec![
            Stmt::Assign(
                v("y"),
                Expr::new(ExprKind::PrimCall(Prim::Add, vec![v("acc"), v("i")]), INT64),
            ),
            Stmt::Assign(v("acc_after"), v("y")),
        ];
        let block = vec![Stmt::ForLoop(ForLoop {
            var: VarName("i".into()),
            start: Expr::int64(0),
            stop: v("n"),
            step: Expr::int64(1),
            body,
            merge,
        })];

        let mut session = Session::default();
        let mut b = Builder::new(&mut session, env.clone());
        let mut renamer = Renamer::new(env);
        renamer.bind(VarName("x".into()), Expr::int64(7));
        let copy = renamer.transform_block(&mut b, &block).unwrap();

        let for_loop = match &copy[..] {
            [Stmt::ForLoop(for_loop)] => for_loop,
            other => panic!("unexpected copy {:?}", other),
        };
        assert_ne!(for_loop.var.0, "i");
        assert_eq!(for_loop.stop, v("n"));
        let (acc, (entry, back)) = for_loop.merge.iter().next().unwrap();
        assert_ne!(acc.0, "acc");
        assert_eq!(entry, &Expr::int64(7));
        match &for_loop.body[..] {
            [Stmt::Assign(y, sum), Stmt::Assign(after, y_ref)] => {
                assert_ne!(y, &v("y"));
                assert_eq!(y_ref, y);
                assert_eq!(after, back);
                assert_eq!(
                    sum.kind,
                    ExprKind::PrimCall(
                        Prim::Add,
                        vec![
                            Expr::var(acc.clone(), INT64),
                            Expr::var(for_loop.var.clone(), INT64)
                        ]
                    )
                );
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
