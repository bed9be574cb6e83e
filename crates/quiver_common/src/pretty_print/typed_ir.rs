use crate::data::typed_ir::{
    Block, Const, Expr, ExprKind, ForLoop, If, MergeMap, Stmt, TilePolicy, TypedFn, While,
};
use std::io;
use std::io::Write;

const TAB_SIZE: usize = 2;

#[derive(Clone, Debug, Copy)]
struct Context {
    indentation: usize,
}

impl Context {
    fn add_indent(&self) -> Context {
        Context {
            indentation: self.indentation + TAB_SIZE,
        }
    }

    fn writeln(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln![w]?;
        write![w, "{}", " ".repeat(self.indentation)]
    }
}

fn write_list(w: &mut dyn Write, exprs: &[Expr]) -> io::Result<()> {
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            write![w, ", "]?;
        }
        write_expr(w, expr)?;
    }
    Ok(())
}

fn write_axes(w: &mut dyn Write, axes: &[usize]) -> io::Result<()> {
    write![w, "axes=["]?;
    for (i, axis) in axes.iter().enumerate() {
        if i > 0 {
            write![w, ", "]?;
        }
        write![w, "{}", axis]?;
    }
    write![w, "]"]
}

fn write_tile(w: &mut dyn Write, tile: TilePolicy) -> io::Result<()> {
    match tile {
        TilePolicy::Fixed => write![w, "tile=fixed"],
        TilePolicy::Dynamic => write![w, "tile=dynamic"],
    }
}

fn write_init(w: &mut dyn Write, init: &Option<Box<Expr>>) -> io::Result<()> {
    match init {
        Some(init) => {
            write![w, ", init="]?;
            write_expr(w, init)
        }
        None => Ok(()),
    }
}

pub fn write_expr(w: &mut dyn Write, expr: &Expr) -> io::Result<()> {
    match &expr.kind {
        ExprKind::Var(name) => write![w, "{}", name],
        ExprKind::Const(Const::Bool(val)) => write![w, "{}", val],
        ExprKind::Const(Const::Int(val)) => write![w, "{}", val],
        ExprKind::Const(Const::Float(val)) => write![w, "{:?}", val],
        ExprKind::Const(Const::None) => write![w, "None"],
        ExprKind::PrimCall(prim, args) => {
            write![w, "{}(", prim.name()]?;
            write_list(w, args)?;
            write![w, ")"]
        }
        ExprKind::Call(func, args) => {
            write![w, "call {}(", func]?;
            write_list(w, args)?;
            write![w, ")"]
        }
        ExprKind::Index(arr, idx) => {
            write_expr(w, arr)?;
            write![w, "["]?;
            write_expr(w, idx)?;
            write![w, "]"]
        }
        ExprKind::TupleProj(tup, idx) => {
            write_expr(w, tup)?;
            write![w, ".{}", idx]
        }
        ExprKind::Attribute(obj, field) => {
            write_expr(w, obj)?;
            write![w, ".{}", field.name()]
        }
        ExprKind::Cast(value) => {
            write![w, "cast<{}>(", expr.type_]?;
            write_expr(w, value)?;
            write![w, ")"]
        }
        ExprKind::Alloc(elt, count) => {
            write![w, "alloc<{}>(", elt]?;
            write_expr(w, count)?;
            write![w, ")"]
        }
        ExprKind::ArrayView {
            data,
            shape,
            strides,
            offset,
            size,
        } => {
            write![w, "view("]?;
            write_list(
                w,
                &[
                    (**data).clone(),
                    (**shape).clone(),
                    (**strides).clone(),
                    (**offset).clone(),
                    (**size).clone(),
                ],
            )?;
            write![w, ")"]
        }
        ExprKind::Tuple(elts) => {
            write![w, "("]?;
            write_list(w, elts)?;
            if elts.len() == 1 {
                write![w, ","]?;
            }
            write![w, ")"]
        }
        ExprKind::Slice { start, stop, step } => {
            if !start.is_none() {
                write_expr(w, start)?;
            }
            write![w, ":"]?;
            if !stop.is_none() {
                write_expr(w, stop)?;
            }
            write![w, ":"]?;
            write_expr(w, step)
        }
        ExprKind::FnRef(func) => write![w, "@{}", func],
        ExprKind::Closure(func, captured) => {
            write![w, "closure @{}[", func]?;
            write_list(w, captured)?;
            write![w, "]"]
        }
        ExprKind::ClosureElt(closure, idx) => {
            write_expr(w, closure)?;
            write![w, ".captured{}", idx]
        }
        ExprKind::Map { func, args, axis } => {
            write![w, "map("]?;
            write_expr(w, func)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], axis={})", axis]
        }
        ExprKind::Reduce {
            func,
            combine,
            init,
            args,
            axis,
        } => {
            write![w, "reduce("]?;
            write_expr(w, func)?;
            write![w, ", combine="]?;
            write_expr(w, combine)?;
            write_init(w, init)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], axis={})", axis]
        }
        ExprKind::Scan {
            func,
            combine,
            emit,
            init,
            args,
            axis,
        } => {
            write![w, "scan("]?;
            write_expr(w, func)?;
            write![w, ", combine="]?;
            write_expr(w, combine)?;
            write![w, ", emit="]?;
            write_expr(w, emit)?;
            write_init(w, init)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], axis={})", axis]
        }
        ExprKind::AllPairs { func, args, axis } => {
            write![w, "allpairs("]?;
            write_expr(w, func)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], axis={})", axis]
        }
        ExprKind::TiledMap {
            func,
            args,
            axes,
            tile,
        } => {
            write![w, "tiled_map("]?;
            write_expr(w, func)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], "]?;
            write_axes(w, axes)?;
            write![w, ", "]?;
            write_tile(w, *tile)?;
            write![w, ")"]
        }
        ExprKind::TiledReduce {
            func,
            combine,
            init,
            args,
            axes,
            tile,
        } => {
            write![w, "tiled_reduce("]?;
            write_expr(w, func)?;
            write![w, ", combine="]?;
            write_expr(w, combine)?;
            write![w, ", init="]?;
            write_expr(w, init)?;
            write![w, ", ["]?;
            write_list(w, args)?;
            write![w, "], "]?;
            write_axes(w, axes)?;
            write![w, ", "]?;
            write_tile(w, *tile)?;
            write![w, ")"]
        }
    }
}

fn write_merge(w: &mut dyn Write, merge: &MergeMap, context: Context) -> io::Result<()> {
    for (name, (left, right)) in merge {
        context.writeln(w)?;
        write![w, "{} = phi(", name]?;
        write_expr(w, left)?;
        write![w, ", "]?;
        write_expr(w, right)?;
        write![w, ")"]?;
    }
    Ok(())
}

fn write_block(w: &mut dyn Write, block: &Block, context: Context) -> io::Result<()> {
    for stmt in block {
        context.writeln(w)?;
        write_stmt(w, stmt, context)?;
    }
    Ok(())
}

fn write_stmt(w: &mut dyn Write, stmt: &Stmt, context: Context) -> io::Result<()> {
    let inner = context.add_indent();
    match stmt {
        Stmt::Assign(lhs, rhs) => {
            write_expr(w, lhs)?;
            write![w, " : {} = ", lhs.type_]?;
            write_expr(w, rhs)
        }
        Stmt::Return(value) => {
            write![w, "return "]?;
            write_expr(w, value)
        }
        Stmt::If(If {
            cond,
            true_block,
            false_block,
            merge,
        }) => {
            write![w, "if "]?;
            write_expr(w, cond)?;
            write![w, " {{"]?;
            write_block(w, true_block, inner)?;
            context.writeln(w)?;
            write![w, "}} else {{"]?;
            write_block(w, false_block, inner)?;
            context.writeln(w)?;
            write![w, "}} merge {{"]?;
            write_merge(w, merge, inner)?;
            context.writeln(w)?;
            write![w, "}}"]
        }
        Stmt::While(While { cond, body, merge }) => {
            write![w, "while "]?;
            write_expr(w, cond)?;
            write![w, " merge {{"]?;
            write_merge(w, merge, inner)?;
            context.writeln(w)?;
            write![w, "}} do {{"]?;
            write_block(w, body, inner)?;
            context.writeln(w)?;
            write![w, "}}"]
        }
        Stmt::ForLoop(ForLoop {
            var,
            start,
            stop,
            step,
            body,
            merge,
        }) => {
            write![w, "for {} in range(", var]?;
            write_list(w, &[start.clone(), stop.clone(), step.clone()])?;
            write![w, ") merge {{"]?;
            write_merge(w, merge, inner)?;
            context.writeln(w)?;
            write![w, "}} do {{"]?;
            write_block(w, body, inner)?;
            context.writeln(w)?;
            write![w, "}}"]
        }
    }
}

pub fn write_fn(w: &mut dyn Write, func: &TypedFn) -> io::Result<()> {
    write![w, "def {}(", func.name]?;
    for (i, (name, type_)) in func.arg_names.iter().zip(&func.input_types).enumerate() {
        if i > 0 {
            write![w, ", "]?;
        }
        write![w, "{}: {}", name, type_]?;
    }
    write![w, ") -> {} {{", func.return_type]?;
    write_block(w, &func.body, Context { indentation: 0 }.add_indent())?;
    writeln![w]?;
    writeln![w, "}}"]
}

pub fn fn_to_string(func: &TypedFn) -> String {
    let mut out = Vec::new();
    // Writing into a `Vec` cannot fail
    let _ = write_fn(&mut out, func);
    String::from_utf8_lossy(&out).into_owned()
}

pub fn expr_to_string(expr: &Expr) -> String {
    let mut out = Vec::new();
    let _ = write_expr(&mut out, expr);
    String::from_utf8_lossy(&out).into_owned()
}
