/// What the work function sees when it processes one slice of a job.
///
/// `inputs` and `outputs` hold the windows of each sliced buffer that belong to this
/// slice, in the order the buffers were declared. The last slice of a job may be
/// shorter than the others. `uniforms` are the full uniform buffers.
///
/// `scratch` is the executing worker's private memory, present when the job requested
/// some. Its content is left over from previous slices or jobs and is never zeroed.
pub struct SliceContext<'c, 'b> {
    pub slice_index: u32,
    pub uniforms: &'c [&'b [u8]],
    pub inputs: &'c [&'b [u8]],
    pub outputs: &'c mut [&'b mut [u8]],
    pub scratch: Option<&'c mut [u8]>,
}

impl<'c, 'b> SliceContext<'c, 'b> {
    /// View a uniform buffer as a slice of `T`.
    #[inline]
    pub fn uniform<T: bytemuck::Pod>(&self, index: usize) -> &'b [T] {
        bytemuck::cast_slice(self.uniforms[index])
    }

    /// View a uniform buffer as a single `T`.
    #[inline]
    pub fn uniform_value<T: bytemuck::Pod>(&self, index: usize) -> &'b T {
        bytemuck::from_bytes(self.uniforms[index])
    }

    #[inline]
    pub fn input<T: bytemuck::Pod>(&self, index: usize) -> &'b [T] {
        bytemuck::cast_slice(self.inputs[index])
    }

    #[inline]
    pub fn output<T: bytemuck::Pod>(&mut self, index: usize) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut *self.outputs[index])
    }

    #[inline]
    pub fn scratch(&mut self) -> Option<&mut [u8]> {
        self.scratch.as_deref_mut()
    }
}
