use std::sync::Arc;

use object::WORD_SIZE;

use crate::builtins;
use crate::id::DefnKey;
use crate::VM;

/// A type tree: either a primitive variant or an object type referring to a
/// class (plus type arguments) or a type parameter. Types are immutable;
/// compound types share structure through `Arc`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Type {
    Unit,
    Boolean,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// The type of `null`: nullable Nothing.
    Null,
    Object(Arc<ObjectType>),
    Variable(Arc<VariableType>),
}

#[derive(PartialEq, Eq, Hash, Debug)]
pub struct ObjectType {
    pub class: DefnKey,
    pub args: Vec<Type>,
    pub nullable: bool,
}

#[derive(PartialEq, Eq, Hash, Debug)]
pub struct VariableType {
    pub param: DefnKey,
    pub nullable: bool,
}

pub type Bindings = Vec<(DefnKey, Type)>;

impl Type {
    pub fn object(class: DefnKey, args: Vec<Type>) -> Type {
        Type::Object(Arc::new(ObjectType { class, args, nullable: false }))
    }

    pub fn nullable_object(class: DefnKey, args: Vec<Type>) -> Type {
        Type::Object(Arc::new(ObjectType { class, args, nullable: true }))
    }

    pub fn variable(param: DefnKey, nullable: bool) -> Type {
        Type::Variable(Arc::new(VariableType { param, nullable }))
    }

    /// Byte size of a value of this type in a field. Stack slots are always
    /// one word regardless.
    pub fn type_size(&self) -> usize {
        match self {
            Type::Unit => 1,
            Type::Boolean => 1,
            Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 => 4,
            Type::I64 => 8,
            Type::F32 => 4,
            Type::F64 => 8,
            Type::Null | Type::Object(_) | Type::Variable(_) => WORD_SIZE,
        }
    }

    pub fn alignment(&self) -> usize {
        self.type_size()
    }

    /// True iff a value of this type is a reference.
    pub fn is_object(&self) -> bool {
        matches!(self, Type::Null | Type::Object(_) | Type::Variable(_))
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_object()
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            Type::Null => true,
            Type::Object(o) => o.nullable,
            Type::Variable(v) => v.nullable,
            _ => false,
        }
    }

    pub fn as_class(&self) -> DefnKey {
        match self {
            Type::Object(o) => o.class,
            _ => panic!("not a class type"),
        }
    }

    pub fn type_arguments(&self) -> &[Type] {
        match self {
            Type::Object(o) => &o.args,
            _ => &[],
        }
    }

    /// The class a value of this type is guaranteed to be an instance of,
    /// chasing variable upper bounds.
    pub fn effective_class(&self, vm: &VM) -> DefnKey {
        let mut current = self.clone();
        loop {
            match current {
                Type::Object(ref o) => return o.class,
                Type::Null => return builtins::NOTHING_CLASS,
                Type::Variable(ref v) => {
                    current = vm.type_parameter(v.param).upper_bound.clone();
                }
                _ => panic!("effective_class on primitive type"),
            }
        }
    }

    /// The parameter → argument map this type induces on its class.
    pub fn argument_bindings(&self, vm: &VM) -> Bindings {
        let Type::Object(o) = self else {
            return Vec::new();
        };
        let class = vm.class(o.class);
        debug_assert_eq!(class.type_params.len(), o.args.len());
        class
            .type_params
            .iter()
            .copied()
            .zip(o.args.iter().cloned())
            .collect()
    }
}

/// Structural subtype check over the class supertype chain. Type arguments
/// compare invariantly.
pub fn is_subtype(vm: &VM, left: &Type, right: &Type) -> bool {
    if left == right {
        return true;
    }
    if left.is_primitive() || right.is_primitive() {
        return false;
    }
    if left.is_nullable() && !right.is_nullable() {
        return false;
    }
    // Null is the nullable bottom: a subtype of every nullable object type.
    if matches!(left, Type::Null) {
        return right.is_nullable();
    }

    // Chase variables: the left to its upper bound, the right to its lower.
    let mut left = left.clone();
    while let Type::Variable(v) = &left {
        let param = vm.type_parameter(v.param);
        left = param.upper_bound.clone();
    }
    let mut right = right.clone();
    while let Type::Variable(v) = &right {
        let param = vm.type_parameter(v.param);
        right = param.lower_bound.clone();
    }
    let (Type::Object(left_obj), Type::Object(right_obj)) = (&left, &right) else {
        return false;
    };

    if left_obj.class == builtins::NOTHING_CLASS {
        return true;
    }
    if !vm.is_subclass_of(left_obj.class, right_obj.class) {
        return false;
    }

    let left_as_base = substitute_for_base_class(vm, &left, right_obj.class);
    let Type::Object(left_as_base) = left_as_base else {
        return false;
    };
    debug_assert_eq!(left_as_base.args.len(), right_obj.args.len());
    left_as_base.args == right_obj.args
}

/// Replace type-parameter occurrences per `bindings`.
pub fn substitute(ty: &Type, bindings: &Bindings) -> Type {
    match ty {
        Type::Variable(v) => {
            for (param, replacement) in bindings {
                if *param == v.param {
                    return replacement.clone();
                }
            }
            ty.clone()
        }
        Type::Object(o) => {
            let mut changed = false;
            let mut new_args = Vec::with_capacity(o.args.len());
            for arg in &o.args {
                let new_arg = substitute(arg, bindings);
                changed |= new_arg != *arg;
                new_args.push(new_arg);
            }
            if !changed {
                return ty.clone();
            }
            Type::Object(Arc::new(ObjectType {
                class: o.class,
                args: new_args,
                nullable: o.nullable,
            }))
        }
        _ => ty.clone(),
    }
}

/// Rewrite `ty`, a type whose class is a subclass of `base`, into the
/// equivalent type at `base` by walking up the supertype chain and
/// substituting at each step.
pub fn substitute_for_base_class(vm: &VM, ty: &Type, base: DefnKey) -> Type {
    let mut current = ty.clone();
    while let Type::Variable(v) = &current {
        current = vm.type_parameter(v.param).upper_bound.clone();
    }
    debug_assert!(vm.is_subclass_of(current.as_class(), base));

    while current.as_class() != base {
        let bindings = current.argument_bindings(vm);
        let class = vm.class(current.as_class());
        let supertype = class.supertype.as_ref().expect("subclass without supertype");
        current = substitute(supertype, &bindings);
    }
    current
}

/// Rewrite `ty` from the defining class's point of view into the receiver's:
/// walk the inheritance path from `receiver_class` down to `defining_class`
/// and apply each supertype's argument bindings in reverse.
pub fn substitute_for_inheritance(
    vm: &VM,
    ty: &Type,
    receiver_class: DefnKey,
    defining_class: DefnKey,
) -> Type {
    debug_assert!(vm.is_subclass_of(receiver_class, defining_class));

    let mut supertypes = Vec::new();
    let mut class = receiver_class;
    while class != defining_class {
        let supertype = vm
            .class(class)
            .supertype
            .as_ref()
            .expect("inheritance path broken")
            .clone();
        class = supertype.as_class();
        supertypes.push(supertype);
    }

    let mut substituted = ty.clone();
    for supertype in supertypes.iter().rev() {
        let bindings = supertype.argument_bindings(vm);
        substituted = substitute(&substituted, &bindings);
    }
    substituted
}
