//! Queue family planning.
use crate::{catalog::QueueFamilyInfo, DeviceCreationError, DeviceSmallVec};
use ash::vk;
use std::hash::{Hash, Hasher};

/// Priority of graphics and compute queues.
pub const HIGH_PRIORITY: f32 = 1.0;
/// Priority of the transfer queue.
pub const LOW_PRIORITY: f32 = 0.0;

/// Criteria for queue families.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueueFamilyCriteria {
    /// A queue family will only be considered if all these flags are set.
    pub must_support: vk::QueueFlags,
    /// A queue family will only be considered
    /// if none of these flags are set.
    pub must_not_support: vk::QueueFlags,
    /// Whether the family must be able to present.
    pub presentation: bool,
}

impl QueueFamilyCriteria {
    /// Queue family criteria that are always met.
    #[inline]
    pub fn none() -> QueueFamilyCriteria {
        QueueFamilyCriteria::default()
    }

    /// A family running graphics and compute work that can also present.
    #[inline]
    pub fn combined() -> QueueFamilyCriteria {
        QueueFamilyCriteria::none()
            .must_support(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            .must_support_presentation()
    }

    /// A transfer family separate from graphics.
    #[inline]
    pub fn dedicated_transfer() -> QueueFamilyCriteria {
        QueueFamilyCriteria::none()
            .must_support(vk::QueueFlags::TRANSFER)
            .must_not_support(vk::QueueFlags::GRAPHICS)
    }

    /// A compute family separate from graphics.
    #[inline]
    pub fn dedicated_compute() -> QueueFamilyCriteria {
        QueueFamilyCriteria::none()
            .must_support(vk::QueueFlags::COMPUTE)
            .must_not_support(vk::QueueFlags::GRAPHICS)
    }

    /// Add an requirement that these queue flags must be present in the
    /// queue family.
    #[inline]
    pub fn must_support(mut self, must_support: vk::QueueFlags) -> QueueFamilyCriteria {
        self.must_support |= must_support;
        self
    }

    /// Add an requirement that these queue flags must **not** be present in the
    /// queue family.
    #[inline]
    pub fn must_not_support(mut self, must_not_support: vk::QueueFlags) -> QueueFamilyCriteria {
        self.must_not_support |= must_not_support;
        self
    }

    /// Require that the queue family must support presentation.
    #[inline]
    pub fn must_support_presentation(mut self) -> QueueFamilyCriteria {
        self.presentation = true;
        self
    }

    /// Returns true if `family` meets the criteria.
    #[inline]
    pub fn matches(&self, family: &QueueFamilyInfo) -> bool {
        family.flags.contains(self.must_support)
            && !family.flags.intersects(self.must_not_support)
            && (!self.presentation || family.supports_present)
            && family.queue_count > 0
    }

    /// Returns the first queue family meeting the criteria.
    #[inline]
    pub fn choose_queue_family<'a>(
        &self,
        families: &'a [QueueFamilyInfo],
    ) -> Option<&'a QueueFamilyInfo> {
        families.iter().find(|family| self.matches(family))
    }
}

/// Setup for [`vk::Queue`] creation.
/// The [`Hash`] and [`PartialEq`] implementations on this struct **only**
/// compare `queue_family_index`.
#[derive(Debug, Clone)]
pub struct QueueSetup {
    /// Flags used to specify usage behavior of the queue.
    pub flags: vk::DeviceQueueCreateFlags,
    /// Index of the queue family in the queue family array.
    pub queue_family_index: u32,
    /// Specifies the amount of queues and the respective priority for each.
    pub queue_priorities: DeviceSmallVec<f32>,
}

impl QueueSetup {
    #[inline]
    fn new(queue_family_index: u32) -> QueueSetup {
        QueueSetup {
            flags: vk::DeviceQueueCreateFlags::empty(),
            queue_family_index,
            queue_priorities: DeviceSmallVec::new(),
        }
    }

    #[inline]
    pub(crate) fn as_vulkan(&self) -> vk::DeviceQueueCreateInfo<'_> {
        vk::DeviceQueueCreateInfo::default()
            .flags(self.flags)
            .queue_family_index(self.queue_family_index)
            .queue_priorities(&self.queue_priorities)
    }
}

impl PartialEq for QueueSetup {
    fn eq(&self, rhs: &Self) -> bool {
        self.queue_family_index == rhs.queue_family_index
    }
}

impl Eq for QueueSetup {}

impl Hash for QueueSetup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.queue_family_index.hash(state);
    }
}

/// A queue role's location: family index and queue index within the family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueLocation {
    /// Queue family index.
    pub family: u32,
    /// Queue index within the family.
    pub index: u32,
}

/// Queue family index of every logical queue role.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueFamilyIndices {
    /// Graphics, compute and present capable family.
    pub graphics: u32,
    /// Family compute work is submitted to.
    pub compute: u32,
    /// Family transfer batches are submitted to.
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Returns true if transfer work runs on a family other than graphics,
    /// in which case resources need queue family ownership transfers.
    #[inline]
    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

/// Assignment of queue roles to queues, plus the queue creation setups.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    /// Graphics and present queue. Always queue 0 of the combined family.
    pub graphics: QueueLocation,
    /// Compute queue. Aliases `graphics` without a dedicated compute family.
    pub compute: QueueLocation,
    /// Transfer queue. Aliases `graphics` without a dedicated transfer family.
    pub transfer: QueueLocation,
    /// One setup per distinct family, consumed verbatim by device creation.
    pub queue_setups: DeviceSmallVec<QueueSetup>,
}

impl QueuePlan {
    /// Plans queues for the given families.
    pub fn new(families: &[QueueFamilyInfo]) -> Result<QueuePlan, DeviceCreationError> {
        if !families
            .iter()
            .any(|family| family.supports(vk::QueueFlags::COMPUTE))
        {
            return Err(DeviceCreationError::NoUsableQueueFamily);
        }

        let combined = QueueFamilyCriteria::combined()
            .choose_queue_family(families)
            .ok_or(DeviceCreationError::NoUsableQueueFamily)?;
        let compute = QueueFamilyCriteria::dedicated_compute()
            .choose_queue_family(families)
            .unwrap_or(combined);
        let transfer = QueueFamilyCriteria::dedicated_transfer()
            .choose_queue_family(families)
            .unwrap_or(combined);

        let mut queue_setups = DeviceSmallVec::<QueueSetup>::new();
        let mut assign = |family: &QueueFamilyInfo, priority: f32| {
            let position = match queue_setups
                .iter()
                .position(|setup| setup.queue_family_index == family.index)
            {
                Some(position) => position,
                None => {
                    queue_setups.push(QueueSetup::new(family.index));
                    queue_setups.len() - 1
                }
            };
            let setup = &mut queue_setups[position];
            if setup.queue_priorities.len() < family.queue_count as usize {
                setup.queue_priorities.push(priority);
            }

            QueueLocation {
                family: family.index,
                index: setup.queue_priorities.len() as u32 - 1,
            }
        };

        let graphics = assign(combined, HIGH_PRIORITY);
        let compute = if compute.index == combined.index {
            graphics
        } else {
            assign(compute, HIGH_PRIORITY)
        };
        let transfer = if transfer.index == combined.index {
            graphics
        } else {
            assign(transfer, LOW_PRIORITY)
        };

        log::info!(
            "queue plan: graphics {graphics:?}, compute {compute:?}, transfer {transfer:?}"
        );

        Ok(QueuePlan {
            graphics,
            compute,
            transfer,
            queue_setups,
        })
    }

    /// Family index of each role.
    #[inline]
    pub fn family_indices(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: self.graphics.family,
            compute: self.compute.family,
            transfer: self.transfer.family,
        }
    }

    /// One `VkDeviceQueueCreateInfo` per family, borrowing the priorities of
    /// [`QueuePlan::queue_setups`].
    #[inline]
    pub fn queue_create_infos(&self) -> DeviceSmallVec<vk::DeviceQueueCreateInfo<'_>> {
        self.queue_setups.iter().map(QueueSetup::as_vulkan).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags, queue_count: u32, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            index,
            flags,
            queue_count,
            supports_present: present,
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn combined_plus_dedicated_transfer() {
        let families = [
            family(0, GCT, 16, true),
            family(1, vk::QueueFlags::TRANSFER, 2, false),
        ];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.graphics, QueueLocation { family: 0, index: 0 });
        assert_eq!(plan.compute, plan.graphics);
        assert_eq!(plan.transfer, QueueLocation { family: 1, index: 0 });
        assert_eq!(plan.queue_setups.len(), 2);
        assert_eq!(plan.queue_setups[0].queue_family_index, 0);
        assert_eq!(plan.queue_setups[0].queue_priorities.as_slice(), &[1.0]);
        assert_eq!(plan.queue_setups[1].queue_family_index, 1);
        assert_eq!(plan.queue_setups[1].queue_priorities.as_slice(), &[0.0]);
        assert!(plan.family_indices().has_dedicated_transfer());
    }

    #[test]
    fn single_family_aliases_everything() {
        let families = [family(0, GCT, 1, true)];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.compute, plan.graphics);
        assert_eq!(plan.transfer, plan.graphics);
        assert_eq!(plan.queue_setups.len(), 1);
        assert_eq!(plan.queue_setups[0].queue_priorities.len(), 1);
        assert!(!plan.family_indices().has_dedicated_transfer());
    }

    #[test]
    fn shared_async_family_gets_two_queues() {
        let families = [family(0, GCT, 1, true), family(1, CT, 2, false)];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.compute, QueueLocation { family: 1, index: 0 });
        assert_eq!(plan.transfer, QueueLocation { family: 1, index: 1 });
        assert_eq!(plan.queue_setups[1].queue_priorities.as_slice(), &[1.0, 0.0]);
    }

    #[test]
    fn shared_async_family_with_one_queue_aliases() {
        let families = [family(0, GCT, 1, true), family(1, CT, 1, false)];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.transfer, plan.compute);
        assert_eq!(plan.queue_setups[1].queue_priorities.as_slice(), &[1.0]);
    }

    #[test]
    fn presentation_decides_combined_family() {
        let families = [
            family(0, GCT, 1, false),
            family(1, GCT, 1, true),
        ];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.graphics.family, 1);
    }

    #[test]
    fn first_match_wins() {
        let families = [
            family(0, GCT, 1, true),
            family(1, vk::QueueFlags::TRANSFER, 1, false),
            family(2, vk::QueueFlags::TRANSFER, 1, false),
        ];
        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.transfer.family, 1);
    }

    #[test]
    fn no_usable_family() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS, 1, true),
            family(1, CT, 1, false),
        ];
        assert!(matches!(
            QueuePlan::new(&families),
            Err(DeviceCreationError::NoUsableQueueFamily)
        ));

        let families = [family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1, true)];
        assert!(matches!(
            QueuePlan::new(&families),
            Err(DeviceCreationError::NoUsableQueueFamily)
        ));
        assert!(matches!(
            QueuePlan::new(&[]),
            Err(DeviceCreationError::NoUsableQueueFamily)
        ));
    }

    #[test]
    fn setups_compare_by_family_only() {
        let mut a = QueueSetup::new(3);
        a.queue_priorities.push(1.0);
        assert_eq!(a, QueueSetup::new(3));
        assert_ne!(a, QueueSetup::new(4));
    }

    #[test]
    fn create_infos_end_before_the_plan_moves() {
        let families = [
            family(0, GCT, 4, true),
            family(1, CT, 2, false),
        ];
        let plan = QueuePlan::new(&families).unwrap();
        let counts = {
            let infos = plan.queue_create_infos();
            assert_eq!(infos.len(), 2);
            infos
                .iter()
                .map(|info| (info.queue_family_index, info.queue_count))
                .collect::<Vec<_>>()
        };
        assert_eq!(counts, [(0, 1), (1, 2)]);

        let moved = plan;
        assert_eq!(moved.transfer, QueueLocation { family: 1, index: 1 });
    }
}
