/// Class tag for a dataset/attribute element type.
///
/// Mirrors `LowFive::Datatype`'s class + byte-size pair; datatype
/// conversion between differing classes is explicitly a non-goal (spec
/// §1), so equality is class + size only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Integer,
    Unsigned,
    Float,
    String,
    VarLenString,
    Compound,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Datatype {
    pub class: TypeClass,
    /// Size in bytes of one element; meaningless (0) for variable-length
    /// strings, whose per-element storage is an index into the dataset's
    /// string table rather than inline bytes.
    pub size: usize,
}

impl Datatype {
    pub const fn fixed(class: TypeClass, size: usize) -> Self {
        Datatype { class, size }
    }

    pub const fn i32() -> Self {
        Self::fixed(TypeClass::Integer, 4)
    }

    pub const fn i64() -> Self {
        Self::fixed(TypeClass::Integer, 8)
    }

    pub const fn f32() -> Self {
        Self::fixed(TypeClass::Float, 4)
    }

    pub const fn f64() -> Self {
        Self::fixed(TypeClass::Float, 8)
    }

    pub const fn var_len_string() -> Self {
        Datatype { class: TypeClass::VarLenString, size: std::mem::size_of::<usize>() }
    }

    pub fn is_var_length_string(&self) -> bool {
        self.class == TypeClass::VarLenString
    }

    /// Byte size of one stored element: the string table index width for
    /// variable-length strings, `size` for everything else.
    pub fn element_size(&self) -> usize {
        if self.is_var_length_string() {
            std::mem::size_of::<usize>()
        } else {
            self.size
        }
    }

    /// Datatypes are compatible for a single triple/dataset iff class and
    /// size match; conversion is unsupported (spec §1 non-goals).
    pub fn compatible(&self, other: &Datatype) -> bool {
        self.class == other.class && self.size == other.size
    }
}
