//! Boolean composition of spatial predicates: NOT / AND / OR over objects.
//!
//! Leaves carry an actual spatial object; interior nodes carry only an
//! operator. Expression-vs-expression tests push negation of the right side
//! inward (flip our own negate, drop theirs) and recurse.

use meridian_core::geometry::Rect;
use meridian_core::Object;
use std::fmt;
use std::sync::Arc;

/// Interior node operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Noop,
    And,
    Or,
}

/// A (maybe negated) spatial object or operator with children.
#[derive(Debug, Clone)]
pub struct AreaExpression {
    pub(crate) negate: bool,
    pub(crate) obj: Option<Arc<Object>>,
    pub(crate) op: BinaryOp,
    pub(crate) children: Vec<AreaExpression>,
}

impl AreaExpression {
    pub fn from_object(obj: Object) -> Self {
        Self::from_object_arc(Arc::new(obj))
    }

    pub fn from_object_arc(obj: Arc<Object>) -> Self {
        AreaExpression {
            negate: false,
            obj: Some(obj),
            op: BinaryOp::Noop,
            children: Vec::new(),
        }
    }

    pub(crate) fn node(negate: bool, op: BinaryOp, children: Vec<AreaExpression>) -> Self {
        AreaExpression {
            negate,
            obj: None,
            op,
            children,
        }
    }

    /// Whether this is an actual expression vs just an object.
    pub fn is_compound(&self) -> bool {
        self.obj.is_none()
    }

    /// The leaf object, when this expression is one.
    pub fn obj(&self) -> Option<&Arc<Object>> {
        self.obj.as_ref()
    }

    /// Tightest rectangle for this expression. Negated leaves cover the
    /// whole supplied bounds.
    pub fn rect(&self, bounds: Rect) -> Rect {
        if let Some(obj) = &self.obj {
            return if self.negate { bounds } else { obj.rect() };
        }
        let mut rect: Option<Rect> = None;
        for child in &self.children {
            let child_rect = child.rect(bounds);
            rect = Some(match rect {
                None => child_rect,
                Some(r) => {
                    if self.op == BinaryOp::And {
                        r.intersection(&child_rect)
                    } else {
                        r.union(&child_rect)
                    }
                }
            });
        }
        rect.unwrap_or(bounds)
    }

    fn maybe_negate(&self, val: bool) -> bool {
        if self.negate {
            !val
        } else {
            val
        }
    }

    fn test_object(
        &self,
        o: &Object,
        obj_obj_test: fn(&Object, &Object) -> bool,
        expr_obj_test: fn(&AreaExpression, &Object) -> bool,
    ) -> bool {
        if let Some(obj) = &self.obj {
            return obj_obj_test(obj, o);
        }
        match self.op {
            BinaryOp::And => self.children.iter().all(|c| expr_obj_test(c, o)),
            BinaryOp::Or => self.children.iter().any(|c| expr_obj_test(c, o)),
            BinaryOp::Noop => false,
        }
    }

    fn raw_intersects(&self, o: &Object) -> bool {
        self.test_object(o, Object::intersects, AreaExpression::intersects)
    }

    fn raw_contains(&self, o: &Object) -> bool {
        self.test_object(o, Object::contains, AreaExpression::contains)
    }

    fn raw_within(&self, o: &Object) -> bool {
        self.test_object(o, Object::within, AreaExpression::within)
    }

    /// Whether the expression area intersects object `o`.
    pub fn intersects(&self, o: &Object) -> bool {
        self.maybe_negate(self.raw_intersects(o))
    }

    /// Whether the expression area contains `o` (i.e. `o` is within it).
    pub fn contains(&self, o: &Object) -> bool {
        self.maybe_negate(self.raw_contains(o))
    }

    /// Whether the expression area is within `o`.
    pub fn within(&self, o: &Object) -> bool {
        self.maybe_negate(self.raw_within(o))
    }

    fn test_expression(
        &self,
        other: &AreaExpression,
        expr_obj_test: fn(&AreaExpression, &Object) -> bool,
        raw_expr_expr_test: fn(&AreaExpression, &AreaExpression) -> bool,
        expr_expr_test: fn(&AreaExpression, &AreaExpression) -> bool,
    ) -> bool {
        if other.negate {
            // push the negation inward: flip ours, drop theirs
            let opposite = AreaExpression {
                negate: !self.negate,
                obj: self.obj.clone(),
                op: self.op,
                children: self.children.clone(),
            };
            let non_negated = AreaExpression {
                negate: false,
                obj: other.obj.clone(),
                op: other.op,
                children: other.children.clone(),
            };
            return expr_expr_test(&opposite, &non_negated);
        }
        if let Some(obj) = &other.obj {
            return expr_obj_test(self, obj);
        }
        match other.op {
            BinaryOp::And => other
                .children
                .iter()
                .all(|c| raw_expr_expr_test(self, c)),
            BinaryOp::Or => other
                .children
                .iter()
                .any(|c| raw_expr_expr_test(self, c)),
            BinaryOp::Noop => false,
        }
    }

    fn raw_intersects_expr(&self, other: &AreaExpression) -> bool {
        self.test_expression(
            other,
            AreaExpression::raw_intersects,
            AreaExpression::raw_intersects_expr,
            AreaExpression::intersects_expr,
        )
    }

    fn raw_within_expr(&self, other: &AreaExpression) -> bool {
        self.test_expression(
            other,
            AreaExpression::raw_within,
            AreaExpression::raw_within_expr,
            AreaExpression::within_expr,
        )
    }

    fn raw_contains_expr(&self, other: &AreaExpression) -> bool {
        self.test_expression(
            other,
            AreaExpression::raw_contains,
            AreaExpression::raw_contains_expr,
            AreaExpression::contains_expr,
        )
    }

    pub fn intersects_expr(&self, other: &AreaExpression) -> bool {
        self.maybe_negate(self.raw_intersects_expr(other))
    }

    pub fn within_expr(&self, other: &AreaExpression) -> bool {
        self.maybe_negate(self.raw_within_expr(other))
    }

    pub fn contains_expr(&self, other: &AreaExpression) -> bool {
        self.maybe_negate(self.raw_contains_expr(other))
    }
}

impl fmt::Display for AreaExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "not ")?;
        }
        match &self.obj {
            Some(obj) => write!(f, "{}", obj.string_repr()),
            None => {
                let sep = match self.op {
                    BinaryOp::And => " and ",
                    BinaryOp::Or => " or ",
                    BinaryOp::Noop => return write!(f, "empty operator"),
                };
                write!(f, "(")?;
                for (i, child) in self.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}
