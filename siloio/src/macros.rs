/// Automatically implements read/write helpers for primitive little-endian
/// values on BlockDev
#[macro_export]
macro_rules! blockdev_impl_primitive_rw {
    ($($ty:ty),+ $(,)?) => {
        $(
            paste::paste! {
                #[inline(always)]
                fn [<write_ $ty _at>](&mut self, block: u16, offset: u32, value: $ty) -> DevResult {
                    self.write(block, offset, &value.to_le_bytes())
                }

                #[inline(always)]
                fn [<read_ $ty _at>](&mut self, block: u16, offset: u32) -> DevResult<$ty> {
                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    self.read(block, offset, &mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )+
    };
}
