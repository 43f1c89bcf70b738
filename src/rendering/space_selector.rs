//! Selection of the sub-space a variable is rendered in
//!
//! Each axis of the (firm, product, week) space is either left whole, narrowed
//! to several values, or pinned to one value. The selection per axis decides
//! the render strategy on that axis:
//!
//! | Selection | Strategy |
//! |---|---|
//! | `All` | `OuterSpace` |
//! | `Many` (2+ values) | `InnerSpace` |
//! | `One` / `Many` with one value | `PositionalCoordinates` |

use rusqlite::types::Value;

use crate::panel::error::PanelError;
use crate::panel::query::Predicate;
use crate::panel::types::{FirmId, ProductId};
use crate::panel::windows::unix_from_running_var;

use super::data_set::{Axis, PanelDataSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisSelection<T> {
    All,
    Many(Vec<T>),
    One(T),
}

impl<T> AxisSelection<T> {
    pub fn strategy(&self) -> RenderStrategy {
        match self {
            AxisSelection::All => RenderStrategy::OuterSpace,
            AxisSelection::Many(values) if values.len() > 1 => RenderStrategy::InnerSpace,
            AxisSelection::Many(_) | AxisSelection::One(_) => RenderStrategy::PositionalCoordinates,
        }
    }

    /// Selected values; `None` for the whole axis
    pub fn values(&self) -> Option<&[T]> {
        match self {
            AxisSelection::All => None,
            AxisSelection::Many(values) => Some(values),
            AxisSelection::One(value) => Some(std::slice::from_ref(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderStrategy {
    /// Rendered over the whole axis
    OuterSpace,
    /// Rendered over several chosen coordinates
    InnerSpace,
    /// Rendered at a single coordinate
    PositionalCoordinates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceSelector {
    pub firm: AxisSelection<FirmId>,
    pub product: AxisSelection<ProductId>,
    pub week: AxisSelection<i64>,
}

impl Default for SpaceSelector {
    fn default() -> Self {
        Self::all()
    }
}

impl SpaceSelector {
    /// The full outer space
    pub fn all() -> Self {
        Self { firm: AxisSelection::All, product: AxisSelection::All, week: AxisSelection::All }
    }

    /// Strategies in axis order: firm, product, week
    pub fn strategies(&self) -> [RenderStrategy; 3] {
        [self.firm.strategy(), self.product.strategy(), self.week.strategy()]
    }

    /// Unix time of the first and last selected week starts
    pub fn dtime_range(&self) -> Option<(i64, i64)> {
        let weeks = self.week.values()?;
        let min = *weeks.iter().min()?;
        let max = *weeks.iter().max()?;
        Some((unix_from_running_var(min), unix_from_running_var(max)))
    }

    /// Predicates restricting panel rows to the selected space
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(firms) = self.firm.values() {
            let values = firms.iter().map(|f| Value::Text(f.clone())).collect();
            predicates.push(Predicate::In(Axis::Firm.column(), values));
        }
        if let Some(products) = self.product.values() {
            let values = products.iter().map(|&p| Value::Integer(p)).collect();
            predicates.push(Predicate::In(Axis::Product.column(), values));
        }
        if let Some(weeks) = self.week.values() {
            let values = weeks.iter().map(|&t| Value::Integer(t)).collect();
            predicates.push(Predicate::In(Axis::Week.column(), values));
        }
        predicates
    }

    /// Fail if a selected coordinate does not occur in the data set
    pub fn check_coordinates(&self, data_set: &PanelDataSet) -> Result<(), PanelError> {
        let selected: [(Axis, Option<Vec<Value>>); 3] = [
            (Axis::Firm, self.firm.values().map(|v| v.iter().map(|f| Value::Text(f.clone())).collect())),
            (Axis::Product, self.product.values().map(|v| v.iter().map(|&p| Value::Integer(p)).collect())),
            (Axis::Week, self.week.values().map(|v| v.iter().map(|&t| Value::Integer(t)).collect())),
        ];

        for (axis, values) in selected {
            let Some(values) = values else { continue };
            let known = data_set.axis_values(axis)?;
            if let Some(unknown) = values.iter().find(|v| !known.contains(v)) {
                return Err(PanelError::InvalidSelection(format!(
                    "{:?} coordinate {:?} is not in the panel",
                    axis, unknown
                )));
            }
        }
        Ok(())
    }
}

fn axis_conforms<T>(strategy: RenderStrategy, selection: &AxisSelection<T>) -> bool {
    match (strategy, selection.values()) {
        (RenderStrategy::OuterSpace, _) => true,
        (RenderStrategy::InnerSpace, Some(values)) => values.len() > 1,
        (RenderStrategy::PositionalCoordinates, Some(values)) => values.len() == 1,
        (_, None) => false,
    }
}

/// Whether `selector` conforms to the per-axis `strategies` (firm, product, week)
pub fn validate_selection_space(strategies: &[RenderStrategy; 3], selector: &SpaceSelector) -> bool {
    axis_conforms(strategies[0], &selector.firm)
        && axis_conforms(strategies[1], &selector.product)
        && axis_conforms(strategies[2], &selector.week)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::db::PanelStore;
    use crate::panel::types::ObservationRow;
    use crate::panel::windows::UNIX_WEEK;

    fn selector() -> SpaceSelector {
        SpaceSelector {
            firm: AxisSelection::All,
            product: AxisSelection::Many(vec![1, 2]),
            week: AxisSelection::One(260),
        }
    }

    #[test]
    fn test_strategies_per_axis() {
        assert_eq!(
            selector().strategies(),
            [RenderStrategy::OuterSpace, RenderStrategy::InnerSpace, RenderStrategy::PositionalCoordinates]
        );
        let single = AxisSelection::Many(vec![7]);
        assert_eq!(single.strategy(), RenderStrategy::PositionalCoordinates);
    }

    #[test]
    fn test_validate_selection_space() {
        let s = selector();
        assert!(validate_selection_space(&s.strategies(), &s));

        let mismatched = [RenderStrategy::OuterSpace, RenderStrategy::PositionalCoordinates, RenderStrategy::PositionalCoordinates];
        assert!(!validate_selection_space(&mismatched, &s));

        let empty = SpaceSelector { product: AxisSelection::Many(vec![]), ..selector() };
        assert!(!validate_selection_space(&empty.strategies(), &empty));

        // An outer strategy accepts any selection on that axis
        assert!(validate_selection_space(&[RenderStrategy::OuterSpace; 3], &s));
    }

    #[test]
    fn test_dtime_range() {
        assert_eq!(SpaceSelector::all().dtime_range(), None);

        let s = SpaceSelector { week: AxisSelection::Many(vec![3, 1, 2]), ..SpaceSelector::all() };
        let (begin, end) = s.dtime_range().unwrap();
        assert_eq!(end - begin, 2 * UNIX_WEEK);
        assert_eq!(begin, unix_from_running_var(1));
    }

    #[test]
    fn test_check_coordinates() {
        let rows = [
            ObservationRow { product_id: 1, firm_id: "shop-a".to_string(), week_running_var: 260, treatment_flag: 1 },
            ObservationRow { product_id: 2, firm_id: "shop-b".to_string(), week_running_var: 260, treatment_flag: 0 },
        ];
        let data_set = PanelDataSet::from_rows(PanelStore::open_in_memory().unwrap(), &rows).unwrap();

        assert!(selector().check_coordinates(&data_set).is_ok());

        let unknown = SpaceSelector { firm: AxisSelection::One("shop-z".to_string()), ..selector() };
        assert!(matches!(unknown.check_coordinates(&data_set), Err(PanelError::InvalidSelection(_))));
    }
}
