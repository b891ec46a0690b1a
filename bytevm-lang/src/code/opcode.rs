//! The CPython 3.6 instruction set.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Opcodes below this value ignore their argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// The opcode number of `EXTENDED_ARG`.
pub const EXTENDED_ARG: u8 = 144;

macro_rules! opcodes {
    ($($variant:ident = $name:literal $number:expr),+ $(,)?) => {
        /// An instruction's operation.
        ///
        /// Plain variants are named after their CPython opcodes. The unary,
        /// binary and in-place operator families are grouped by suffix.
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum Opcode {
            $($variant,)+
            /// `UNARY_<operator>`
            Unary(UnaryOperator),
            /// `BINARY_<operator>`
            Binary(BinaryOperator),
            /// `INPLACE_<operator>`
            Inplace(BinaryOperator),
        }

        const PLAIN_OPCODES: &[(Opcode, &str, Option<u8>)] = &[
            $((Opcode::$variant, $name, $number),)+
        ];
    };
}

opcodes! {
    PopTop = "POP_TOP" Some(1),
    RotTwo = "ROT_TWO" Some(2),
    RotThree = "ROT_THREE" Some(3),
    DupTop = "DUP_TOP" Some(4),
    DupTopTwo = "DUP_TOP_TWO" Some(5),
    Nop = "NOP" Some(9),
    StoreSubscr = "STORE_SUBSCR" Some(60),
    DeleteSubscr = "DELETE_SUBSCR" Some(61),
    GetIter = "GET_ITER" Some(68),
    GetYieldFromIter = "GET_YIELD_FROM_ITER" Some(69),
    PrintExpr = "PRINT_EXPR" Some(70),
    LoadBuildClass = "LOAD_BUILD_CLASS" Some(71),
    YieldFrom = "YIELD_FROM" Some(72),
    BreakLoop = "BREAK_LOOP" Some(80),
    WithCleanupStart = "WITH_CLEANUP_START" Some(81),
    WithCleanupFinish = "WITH_CLEANUP_FINISH" Some(82),
    ReturnValue = "RETURN_VALUE" Some(83),
    ImportStar = "IMPORT_STAR" Some(84),
    SetupAnnotations = "SETUP_ANNOTATIONS" Some(85),
    YieldValue = "YIELD_VALUE" Some(86),
    PopBlock = "POP_BLOCK" Some(87),
    EndFinally = "END_FINALLY" Some(88),
    PopExcept = "POP_EXCEPT" Some(89),
    StoreName = "STORE_NAME" Some(90),
    DeleteName = "DELETE_NAME" Some(91),
    UnpackSequence = "UNPACK_SEQUENCE" Some(92),
    ForIter = "FOR_ITER" Some(93),
    UnpackEx = "UNPACK_EX" Some(94),
    StoreAttr = "STORE_ATTR" Some(95),
    DeleteAttr = "DELETE_ATTR" Some(96),
    StoreGlobal = "STORE_GLOBAL" Some(97),
    DeleteGlobal = "DELETE_GLOBAL" Some(98),
    LoadConst = "LOAD_CONST" Some(100),
    LoadName = "LOAD_NAME" Some(101),
    BuildTuple = "BUILD_TUPLE" Some(102),
    BuildList = "BUILD_LIST" Some(103),
    BuildSet = "BUILD_SET" Some(104),
    BuildMap = "BUILD_MAP" Some(105),
    LoadAttr = "LOAD_ATTR" Some(106),
    CompareOp = "COMPARE_OP" Some(107),
    ImportName = "IMPORT_NAME" Some(108),
    ImportFrom = "IMPORT_FROM" Some(109),
    JumpForward = "JUMP_FORWARD" Some(110),
    JumpIfFalseOrPop = "JUMP_IF_FALSE_OR_POP" Some(111),
    JumpIfTrueOrPop = "JUMP_IF_TRUE_OR_POP" Some(112),
    JumpAbsolute = "JUMP_ABSOLUTE" Some(113),
    PopJumpIfFalse = "POP_JUMP_IF_FALSE" Some(114),
    PopJumpIfTrue = "POP_JUMP_IF_TRUE" Some(115),
    LoadGlobal = "LOAD_GLOBAL" Some(116),
    ContinueLoop = "CONTINUE_LOOP" Some(119),
    SetupLoop = "SETUP_LOOP" Some(120),
    SetupExcept = "SETUP_EXCEPT" Some(121),
    SetupFinally = "SETUP_FINALLY" Some(122),
    LoadFast = "LOAD_FAST" Some(124),
    StoreFast = "STORE_FAST" Some(125),
    DeleteFast = "DELETE_FAST" Some(126),
    StoreAnnotation = "STORE_ANNOTATION" Some(127),
    RaiseVarargs = "RAISE_VARARGS" Some(130),
    CallFunction = "CALL_FUNCTION" Some(131),
    MakeFunction = "MAKE_FUNCTION" Some(132),
    BuildSlice = "BUILD_SLICE" Some(133),
    LoadClosure = "LOAD_CLOSURE" Some(135),
    LoadDeref = "LOAD_DEREF" Some(136),
    StoreDeref = "STORE_DEREF" Some(137),
    DeleteDeref = "DELETE_DEREF" Some(138),
    CallFunctionKw = "CALL_FUNCTION_KW" Some(141),
    CallFunctionEx = "CALL_FUNCTION_EX" Some(142),
    SetupWith = "SETUP_WITH" Some(143),
    ExtendedArg = "EXTENDED_ARG" Some(EXTENDED_ARG),
    ListAppend = "LIST_APPEND" Some(145),
    SetAdd = "SET_ADD" Some(146),
    MapAdd = "MAP_ADD" Some(147),
    LoadClassDeref = "LOAD_CLASSDEREF" Some(148),
    BuildListUnpack = "BUILD_LIST_UNPACK" Some(149),
    BuildMapUnpack = "BUILD_MAP_UNPACK" Some(150),
    BuildMapUnpackWithCall = "BUILD_MAP_UNPACK_WITH_CALL" Some(151),
    BuildTupleUnpack = "BUILD_TUPLE_UNPACK" Some(152),
    BuildSetUnpack = "BUILD_SET_UNPACK" Some(153),
    FormatValue = "FORMAT_VALUE" Some(155),
    BuildConstKeyMap = "BUILD_CONST_KEY_MAP" Some(156),
    BuildString = "BUILD_STRING" Some(157),
    BuildTupleUnpackWithCall = "BUILD_TUPLE_UNPACK_WITH_CALL" Some(158),
    // The 3.5 variadic call encodings have no 3.6 opcode number. They are
    // only reachable from the logical instruction form.
    CallFunctionVar = "CALL_FUNCTION_VAR" None,
    CallFunctionVarKw = "CALL_FUNCTION_VAR_KW" None,
}

/// A `UNARY_*` operator.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum UnaryOperator {
    Positive,
    Negative,
    Not,
    Invert,
}

impl UnaryOperator {
    const TABLE: &'static [(UnaryOperator, &'static str, u8)] = &[
        (UnaryOperator::Positive, "POSITIVE", 10),
        (UnaryOperator::Negative, "NEGATIVE", 11),
        (UnaryOperator::Not, "NOT", 12),
        (UnaryOperator::Invert, "INVERT", 15),
    ];

    /// Returns the opcode name suffix of this operator.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        Self::TABLE
            .iter()
            .find_map(|(op, suffix, _)| (*op == self).then_some(*suffix))
            .unwrap_or_default()
    }

    /// Returns the source-level symbol of this operator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::Positive => "unary +",
            UnaryOperator::Negative => "unary -",
            UnaryOperator::Not => "not",
            UnaryOperator::Invert => "unary ~",
        }
    }
}

/// A `BINARY_*` or `INPLACE_*` operator.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BinaryOperator {
    Power,
    Multiply,
    MatrixMultiply,
    FloorDivide,
    TrueDivide,
    Modulo,
    Add,
    Subtract,
    Subscr,
    LShift,
    RShift,
    And,
    Xor,
    Or,
}

impl BinaryOperator {
    /// `(operator, suffix, BINARY_ number, INPLACE_ number)`
    const TABLE: &'static [(BinaryOperator, &'static str, u8, Option<u8>)] = &[
        (BinaryOperator::Power, "POWER", 19, Some(67)),
        (BinaryOperator::Multiply, "MULTIPLY", 20, Some(57)),
        (BinaryOperator::MatrixMultiply, "MATRIX_MULTIPLY", 16, Some(17)),
        (BinaryOperator::FloorDivide, "FLOOR_DIVIDE", 26, Some(28)),
        (BinaryOperator::TrueDivide, "TRUE_DIVIDE", 27, Some(29)),
        (BinaryOperator::Modulo, "MODULO", 22, Some(59)),
        (BinaryOperator::Add, "ADD", 23, Some(55)),
        (BinaryOperator::Subtract, "SUBTRACT", 24, Some(56)),
        (BinaryOperator::Subscr, "SUBSCR", 25, None),
        (BinaryOperator::LShift, "LSHIFT", 62, Some(75)),
        (BinaryOperator::RShift, "RSHIFT", 63, Some(76)),
        (BinaryOperator::And, "AND", 64, Some(77)),
        (BinaryOperator::Xor, "XOR", 65, Some(78)),
        (BinaryOperator::Or, "OR", 66, Some(79)),
    ];

    /// Returns the opcode name suffix of this operator.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        Self::TABLE
            .iter()
            .find_map(|(op, suffix, ..)| (*op == self).then_some(*suffix))
            .unwrap_or_default()
    }

    /// Returns the source-level symbol of this operator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Power => "** or pow()",
            BinaryOperator::Multiply => "*",
            BinaryOperator::MatrixMultiply => "@",
            BinaryOperator::FloorDivide => "//",
            BinaryOperator::TrueDivide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Subscr => "[]",
            BinaryOperator::LShift => "<<",
            BinaryOperator::RShift => ">>",
            BinaryOperator::And => "&",
            BinaryOperator::Xor => "^",
            BinaryOperator::Or => "|",
        }
    }

    /// Returns the special method name classes implement this operator
    /// with.
    #[must_use]
    pub const fn dunder(self) -> &'static str {
        match self {
            BinaryOperator::Power => "__pow__",
            BinaryOperator::Multiply => "__mul__",
            BinaryOperator::MatrixMultiply => "__matmul__",
            BinaryOperator::FloorDivide => "__floordiv__",
            BinaryOperator::TrueDivide => "__truediv__",
            BinaryOperator::Modulo => "__mod__",
            BinaryOperator::Add => "__add__",
            BinaryOperator::Subtract => "__sub__",
            BinaryOperator::Subscr => "__getitem__",
            BinaryOperator::LShift => "__lshift__",
            BinaryOperator::RShift => "__rshift__",
            BinaryOperator::And => "__and__",
            BinaryOperator::Xor => "__xor__",
            BinaryOperator::Or => "__or__",
        }
    }
}

/// The operator selected by a `COMPARE_OP` argument.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareOp {
    /// Operators indexed by their `COMPARE_OP` argument.
    pub const TABLE: [CompareOp; 11] = [
        CompareOp::Less,
        CompareOp::LessEqual,
        CompareOp::Equal,
        CompareOp::NotEqual,
        CompareOp::Greater,
        CompareOp::GreaterEqual,
        CompareOp::In,
        CompareOp::NotIn,
        CompareOp::Is,
        CompareOp::IsNot,
        CompareOp::ExceptionMatch,
    ];

    /// Returns the operator for a `COMPARE_OP` argument.
    #[must_use]
    pub fn from_arg(arg: u32) -> Option<Self> {
        Self::TABLE.get(usize::try_from(arg).ok()?).copied()
    }

    /// Returns the `COMPARE_OP` argument for this operator.
    #[must_use]
    pub fn arg(self) -> u32 {
        let index = Self::TABLE
            .iter()
            .position(|op| *op == self)
            .unwrap_or_default();
        u32::try_from(index).unwrap_or_default()
    }

    /// Returns the source-level symbol of this operator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            CompareOp::Less => "<",
            CompareOp::LessEqual => "<=",
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEqual => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::ExceptionMatch => "exception match",
        }
    }
}

/// How an instruction's argument is resolved.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OperandKind {
    /// The argument is ignored.
    None,
    /// An index into the code object's constants.
    Const,
    /// An index into the code object's names.
    Name,
    /// An index into the code object's local variable names.
    Local,
    /// An index into the code object's cell variables followed by its free
    /// variables.
    Free,
    /// A jump relative to the following instruction.
    RelativeJump,
    /// A jump to an absolute offset.
    AbsoluteJump,
    /// An index into [`CompareOp::TABLE`].
    Compare,
    /// A raw integer.
    Raw,
}

impl Opcode {
    /// Returns the CPython name of this opcode.
    #[must_use]
    pub fn name(self) -> String {
        match self {
            Opcode::Unary(op) => format!("UNARY_{}", op.suffix()),
            Opcode::Binary(op) => format!("BINARY_{}", op.suffix()),
            Opcode::Inplace(op) => format!("INPLACE_{}", op.suffix()),
            plain => PLAIN_OPCODES
                .iter()
                .find_map(|(opcode, name, _)| (*opcode == plain).then_some(*name))
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Parses a CPython opcode name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(suffix) = name.strip_prefix("UNARY_") {
            UnaryOperator::TABLE
                .iter()
                .find_map(|(op, op_suffix, _)| (*op_suffix == suffix).then_some(Opcode::Unary(*op)))
        } else if let Some(suffix) = name.strip_prefix("BINARY_") {
            BinaryOperator::TABLE
                .iter()
                .find_map(|(op, op_suffix, ..)| (*op_suffix == suffix).then_some(Opcode::Binary(*op)))
        } else if let Some(suffix) = name.strip_prefix("INPLACE_") {
            BinaryOperator::TABLE.iter().find_map(|(op, op_suffix, _, inplace)| {
                (*op_suffix == suffix && inplace.is_some()).then_some(Opcode::Inplace(*op))
            })
        } else {
            PLAIN_OPCODES
                .iter()
                .find_map(|(opcode, opcode_name, _)| (*opcode_name == name).then_some(*opcode))
        }
    }

    /// Returns the 3.6 opcode number, if this opcode has one.
    #[must_use]
    pub fn number(self) -> Option<u8> {
        match self {
            Opcode::Unary(op) => UnaryOperator::TABLE
                .iter()
                .find_map(|(candidate, _, number)| (*candidate == op).then_some(*number)),
            Opcode::Binary(op) => BinaryOperator::TABLE
                .iter()
                .find_map(|(candidate, _, number, _)| (*candidate == op).then_some(*number)),
            Opcode::Inplace(op) => BinaryOperator::TABLE
                .iter()
                .find_map(|(candidate, _, _, number)| (*candidate == op).then_some(*number))
                .flatten(),
            plain => PLAIN_OPCODES
                .iter()
                .find_map(|(opcode, _, number)| (*opcode == plain).then_some(*number))
                .flatten(),
        }
    }

    /// Returns the opcode for a 3.6 opcode number.
    #[must_use]
    pub fn from_number(number: u8) -> Option<Self> {
        static BY_NUMBER: OnceLock<[Option<Opcode>; 256]> = OnceLock::new();
        BY_NUMBER.get_or_init(|| {
            let mut table = [None; 256];
            let unary = UnaryOperator::TABLE
                .iter()
                .map(|(op, _, number)| (Opcode::Unary(*op), Some(*number)));
            let binary = BinaryOperator::TABLE
                .iter()
                .map(|(op, _, number, _)| (Opcode::Binary(*op), Some(*number)));
            let inplace = BinaryOperator::TABLE
                .iter()
                .map(|(op, _, _, number)| (Opcode::Inplace(*op), *number));
            let plain = PLAIN_OPCODES.iter().map(|(op, _, number)| (*op, *number));
            for (opcode, number) in unary.chain(binary).chain(inplace).chain(plain) {
                if let Some(number) = number {
                    table[usize::from(number)] = Some(opcode);
                }
            }
            table
        })[usize::from(number)]
    }

    /// Returns true if this opcode uses its argument.
    #[must_use]
    pub fn has_argument(self) -> bool {
        self.number().map_or(true, |number| number >= HAVE_ARGUMENT)
    }

    /// Returns how this opcode's argument is resolved.
    #[must_use]
    pub const fn operand_kind(self) -> OperandKind {
        match self {
            Opcode::LoadConst => OperandKind::Const,
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::LoadAttr
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadGlobal
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::StoreAnnotation => OperandKind::Name,
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => OperandKind::Local,
            Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClassDeref => OperandKind::Free,
            Opcode::ForIter
            | Opcode::JumpForward
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally
            | Opcode::SetupWith => OperandKind::RelativeJump,
            Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::ContinueLoop => OperandKind::AbsoluteJump,
            Opcode::CompareOp => OperandKind::Compare,
            Opcode::UnpackSequence
            | Opcode::UnpackEx
            | Opcode::BuildTuple
            | Opcode::BuildList
            | Opcode::BuildSet
            | Opcode::BuildMap
            | Opcode::RaiseVarargs
            | Opcode::CallFunction
            | Opcode::MakeFunction
            | Opcode::BuildSlice
            | Opcode::CallFunctionKw
            | Opcode::CallFunctionEx
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionVarKw
            | Opcode::ExtendedArg
            | Opcode::ListAppend
            | Opcode::SetAdd
            | Opcode::MapAdd
            | Opcode::BuildListUnpack
            | Opcode::BuildMapUnpack
            | Opcode::BuildMapUnpackWithCall
            | Opcode::BuildTupleUnpack
            | Opcode::BuildSetUnpack
            | Opcode::FormatValue
            | Opcode::BuildConstKeyMap
            | Opcode::BuildString
            | Opcode::BuildTupleUnpackWithCall => OperandKind::Raw,
            _ => OperandKind::None,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// An opcode name that is not part of the supported instruction set.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnknownOpcode(pub String);

impl Display for UnknownOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown opcode {}", self.0)
    }
}

impl std::error::Error for UnknownOpcode {}

impl FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownOpcode(s.to_string()))
    }
}

impl TryFrom<String> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Opcode> for String {
    fn from(value: Opcode) -> Self {
        value.name()
    }
}
