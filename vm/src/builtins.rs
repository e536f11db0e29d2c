//! The builtin package: the root class, strings, exceptions, the table map
//! and their intrinsic functions. Builtin definitions are addressed from
//! bytecode and package files by negative ids; in memory they live in a
//! reserved package slot.

use object::str_meta;

use crate::class::Class;
use crate::function::Function;
use crate::id::{DefnFlags, DefnKey};
use crate::name::Name;
use crate::ty::Type;

// Class indices.
pub const OBJECT_CLASS: DefnKey = DefnKey::builtin(0);
pub const NOTHING_CLASS: DefnKey = DefnKey::builtin(1);
pub const STRING_CLASS: DefnKey = DefnKey::builtin(2);
pub const TYPE_CLASS: DefnKey = DefnKey::builtin(3);
pub const PACKAGE_CLASS: DefnKey = DefnKey::builtin(4);
pub const TABLE_CLASS: DefnKey = DefnKey::builtin(5);
pub const EXCEPTION_CLASS: DefnKey = DefnKey::builtin(6);
pub const NULL_POINTER_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(7);
pub const UNINITIALIZED_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(8);
pub const OUT_OF_BOUNDS_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(9);
pub const CAST_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(10);
pub const ARITHMETIC_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(11);
pub const NO_SUCH_ELEMENT_EXCEPTION_CLASS: DefnKey = DefnKey::builtin(12);

// Function indices.
pub const OBJECT_CTOR_FN: DefnKey = DefnKey::builtin(0);
pub const EXCEPTION_CTOR_FN: DefnKey = DefnKey::builtin(1);
pub const STRING_CONCAT_FN: DefnKey = DefnKey::builtin(2);
pub const STRING_EQ_FN: DefnKey = DefnKey::builtin(3);
pub const STRING_LEN_FN: DefnKey = DefnKey::builtin(4);
pub const PRINT_FN: DefnKey = DefnKey::builtin(5);
pub const TABLE_NEW_FN: DefnKey = DefnKey::builtin(6);
pub const TABLE_INSERT_FN: DefnKey = DefnKey::builtin(7);
pub const TABLE_CONTAINS_FN: DefnKey = DefnKey::builtin(8);
pub const TABLE_GET_FN: DefnKey = DefnKey::builtin(9);
pub const TABLE_REMOVE_FN: DefnKey = DefnKey::builtin(10);
pub const TABLE_LEN_FN: DefnKey = DefnKey::builtin(11);

/// The package id reserved for builtins never hosts real globals or type
/// parameters.
pub struct Builtins {
    pub classes: Box<[Class]>,
    pub functions: Box<[Function]>,
}

fn name(text: &str) -> Name {
    Name::from_defn_string(text).expect("builtin name")
}

fn object_type(class: DefnKey) -> Type {
    Type::object(class, vec![])
}

fn class(
    class_name: &str,
    supertype: Option<Type>,
    fields: Vec<crate::class::Field>,
    constructors: Vec<DefnKey>,
    methods: Vec<DefnKey>,
    element_type: Option<Type>,
    length_field_index: Option<u32>,
) -> Class {
    Class::new(
        name(class_name),
        name(class_name),
        DefnFlags::PUBLIC,
        Box::new([]),
        supertype,
        fields.into_boxed_slice(),
        constructors.into_boxed_slice(),
        methods.into_boxed_slice(),
        crate::id::BUILTIN_PACKAGE,
        element_type,
        length_field_index,
    )
}

fn exception_class(class_name: &str) -> Class {
    class(
        class_name,
        Some(object_type(EXCEPTION_CLASS)),
        vec![],
        vec![EXCEPTION_CTOR_FN],
        vec![],
        None,
        None,
    )
}

fn function(
    fn_name: &str,
    builtin: DefnKey,
    flags: DefnFlags,
    return_type: Type,
    param_types: Vec<Type>,
) -> Function {
    Function {
        name: name(fn_name),
        source_name: name(fn_name),
        flags,
        builtin_id: crate::id::builtin_id(builtin.index),
        type_params: Box::new([]),
        return_type,
        param_types: param_types.into_boxed_slice(),
        package: crate::id::BUILTIN_PACKAGE,
        locals_size: 0,
        instructions: Box::new([]),
        block_offsets: Box::new([]),
        overrides: Box::new([]),
        inst_types: Box::new([]),
        stack_map: Default::default(),
        native_code: Default::default(),
        native_cif: Default::default(),
    }
}

impl Builtins {
    pub fn new() -> Builtins {
        let length_flags = DefnFlags::PUBLIC | DefnFlags::CONST | DefnFlags::ARRAY_LENGTH;

        let classes = vec![
            // Object: the root.
            class("Object", None, vec![], vec![OBJECT_CTOR_FN], vec![], None, None),
            class("Nothing", Some(object_type(OBJECT_CLASS)), vec![], vec![], vec![], None, None),
            class(
                "String",
                Some(object_type(OBJECT_CLASS)),
                vec![crate::class::Field {
                    name: name("length"),
                    flags: length_flags,
                    ty: Type::I64,
                }],
                vec![],
                vec![STRING_CONCAT_FN, STRING_EQ_FN, STRING_LEN_FN],
                Some(Type::I8),
                Some(0),
            )
            .with_fixed_meta(str_meta(STRING_CLASS.pack())),
            class("Type", Some(object_type(OBJECT_CLASS)), vec![], vec![], vec![], None, None),
            class(
                "Package",
                Some(object_type(OBJECT_CLASS)),
                vec![crate::class::Field {
                    name: name("id"),
                    flags: DefnFlags::CONST,
                    ty: Type::I64,
                }],
                vec![],
                vec![],
                None,
                None,
            ),
            // The table presents a stable identity; its entries live in a
            // separate block that is swapped out on growth.
            class(
                "Table",
                Some(object_type(OBJECT_CLASS)),
                vec![crate::class::Field {
                    name: name("entries"),
                    flags: DefnFlags::PRIVATE,
                    ty: Type::nullable_object(OBJECT_CLASS, vec![]),
                }],
                vec![],
                vec![
                    TABLE_INSERT_FN,
                    TABLE_CONTAINS_FN,
                    TABLE_GET_FN,
                    TABLE_REMOVE_FN,
                    TABLE_LEN_FN,
                ],
                None,
                None,
            ),
            class(
                "Exception",
                Some(object_type(OBJECT_CLASS)),
                vec![],
                vec![EXCEPTION_CTOR_FN],
                vec![],
                None,
                None,
            ),
            exception_class("NullPointerException"),
            exception_class("UninitializedException"),
            exception_class("OutOfBoundsException"),
            exception_class("CastException"),
            exception_class("ArithmeticException"),
            exception_class("NoSuchElementException"),
        ];

        let method = DefnFlags::PUBLIC | DefnFlags::METHOD;
        let ctor = method | DefnFlags::CONSTRUCTOR;
        let string_ty = object_type(STRING_CLASS);
        let table_ty = object_type(TABLE_CLASS);

        let functions = vec![
            function(
                "Object.init",
                OBJECT_CTOR_FN,
                ctor,
                Type::Unit,
                vec![object_type(OBJECT_CLASS)],
            ),
            function(
                "Exception.init",
                EXCEPTION_CTOR_FN,
                ctor,
                Type::Unit,
                vec![object_type(EXCEPTION_CLASS)],
            ),
            function(
                "String.concat",
                STRING_CONCAT_FN,
                method,
                string_ty.clone(),
                vec![string_ty.clone(), string_ty.clone()],
            ),
            function(
                "String.eq",
                STRING_EQ_FN,
                method,
                Type::Boolean,
                vec![string_ty.clone(), string_ty.clone()],
            ),
            function(
                "String.length",
                STRING_LEN_FN,
                method,
                Type::I64,
                vec![string_ty.clone()],
            ),
            function(
                "print",
                PRINT_FN,
                DefnFlags::PUBLIC | DefnFlags::STATIC,
                Type::Unit,
                vec![string_ty.clone()],
            ),
            function(
                "Table.new",
                TABLE_NEW_FN,
                DefnFlags::PUBLIC | DefnFlags::STATIC,
                table_ty.clone(),
                vec![],
            ),
            function(
                "Table.insert",
                TABLE_INSERT_FN,
                method,
                Type::Boolean,
                vec![table_ty.clone(), string_ty.clone(), Type::I64],
            ),
            function(
                "Table.contains",
                TABLE_CONTAINS_FN,
                method,
                Type::Boolean,
                vec![table_ty.clone(), string_ty.clone()],
            ),
            function(
                "Table.get",
                TABLE_GET_FN,
                method,
                Type::I64,
                vec![table_ty.clone(), string_ty.clone()],
            ),
            function(
                "Table.remove",
                TABLE_REMOVE_FN,
                method,
                Type::I64,
                vec![table_ty.clone(), string_ty.clone()],
            ),
            function("Table.length", TABLE_LEN_FN, method, Type::I64, vec![table_ty]),
        ];

        Builtins {
            classes: classes.into_boxed_slice(),
            functions: functions.into_boxed_slice(),
        }
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::new()
    }
}
