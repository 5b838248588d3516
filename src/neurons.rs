//! Дескрипторы наборов нейронов.
//!
//! `Neurons` и `Neurons3D` - это чистые метаданные формы: они описывают,
//! *сколько* признаков проходит через границу между двумя компонентами
//! графа, но никогда не содержат самих значений. Значения живут в
//! [`NeuronsActivation`](crate::activation::NeuronsActivation).

/// Дескриптор одномерного набора нейронов.
///
/// `has_bias_unit` означает, что трансформация через эту границу аффинная:
/// у аксонов слева от неё есть вектор смещений.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neurons {
    /// Количество нейронов (без учёта bias-юнита).
    pub neuron_count: usize,
    /// Есть ли всегда-единичный bias-юнит.
    pub has_bias_unit: bool,
}

impl Neurons {
    pub fn new(neuron_count: usize, has_bias_unit: bool) -> Self {
        Self {
            neuron_count,
            has_bias_unit,
        }
    }
}

/// Дескриптор трёхмерного (пространственного) набора нейронов.
///
/// Используется свёрточными и пулинг-аксонами. Порядок индексации признаков
/// канально-мажорный: `f = c * (height * width) + y * width + x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neurons3D {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub has_bias_unit: bool,
}

impl Neurons3D {
    pub fn new(width: usize, height: usize, depth: usize, has_bias_unit: bool) -> Self {
        Self {
            width,
            height,
            depth,
            has_bias_unit,
        }
    }

    /// Общее количество нейронов: `width * height * depth`.
    pub fn neuron_count(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Плоское представление этого же набора нейронов.
    pub fn flat(&self) -> Neurons {
        Neurons::new(self.neuron_count(), self.has_bias_unit)
    }
}

/// Дескриптор, который несёт каждая активация: либо плоский, либо
/// пространственный набор нейронов.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeuronsDescriptor {
    Flat(Neurons),
    Spatial(Neurons3D),
}

impl NeuronsDescriptor {
    pub fn neuron_count(&self) -> usize {
        match self {
            NeuronsDescriptor::Flat(n) => n.neuron_count,
            NeuronsDescriptor::Spatial(n) => n.neuron_count(),
        }
    }

    pub fn has_bias_unit(&self) -> bool {
        match self {
            NeuronsDescriptor::Flat(n) => n.has_bias_unit,
            NeuronsDescriptor::Spatial(n) => n.has_bias_unit,
        }
    }

    /// Пространственный дескриптор, если он есть.
    pub fn spatial(&self) -> Option<&Neurons3D> {
        match self {
            NeuronsDescriptor::Spatial(n) => Some(n),
            NeuronsDescriptor::Flat(_) => None,
        }
    }

    /// Плоский вид: для пространственного дескриптора - его развёртка.
    pub fn as_flat(&self) -> Neurons {
        match self {
            NeuronsDescriptor::Flat(n) => *n,
            NeuronsDescriptor::Spatial(n) => n.flat(),
        }
    }
}

impl From<Neurons> for NeuronsDescriptor {
    fn from(neurons: Neurons) -> Self {
        NeuronsDescriptor::Flat(neurons)
    }
}

impl From<Neurons3D> for NeuronsDescriptor {
    fn from(neurons: Neurons3D) -> Self {
        NeuronsDescriptor::Spatial(neurons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neurons3d_count() {
        let n = Neurons3D::new(28, 28, 3, false);
        assert_eq!(n.neuron_count(), 28 * 28 * 3);
        assert_eq!(n.flat().neuron_count, 2352);
    }

    #[test]
    fn test_descriptor_spatial_access() {
        let d: NeuronsDescriptor = Neurons3D::new(4, 4, 2, false).into();
        assert!(d.spatial().is_some());
        assert_eq!(d.neuron_count(), 32);

        let f: NeuronsDescriptor = Neurons::new(10, true).into();
        assert!(f.spatial().is_none());
        assert!(f.has_bias_unit());
    }
}
