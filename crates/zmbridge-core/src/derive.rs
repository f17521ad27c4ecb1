use crate::model::{Analysing, Capturing, MonitorFunction, RecordingMode, SubModes};

pub const CUSTOM_LABEL: &str = "Custom";

pub fn sub_modes_for(function: MonitorFunction) -> SubModes {
    use Analysing as A;
    use Capturing as C;
    use RecordingMode as R;

    match function {
        MonitorFunction::None => SubModes::new(C::None, A::None, R::None),
        MonitorFunction::Monitor => SubModes::new(C::Always, A::None, R::None),
        MonitorFunction::Modect => SubModes::new(C::Always, A::Always, R::OnMotion),
        MonitorFunction::Record => SubModes::new(C::Always, A::None, R::Always),
        MonitorFunction::Mocord => SubModes::new(C::Always, A::Always, R::Always),
        MonitorFunction::Nodect => SubModes::new(C::Always, A::None, R::OnMotion),
    }
}

pub fn classic_function(modes: SubModes) -> Option<MonitorFunction> {
    MonitorFunction::ALL
        .into_iter()
        .find(|function| sub_modes_for(*function) == modes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveFunction {
    Classic(MonitorFunction),
    // Sub-modes present but matching no classic function.
    Composed(SubModes),
    Unknown,
}

pub fn effective_function(
    classic: Option<MonitorFunction>,
    sub_modes: Option<SubModes>,
) -> EffectiveFunction {
    match sub_modes {
        Some(modes) => match classic_function(modes) {
            Some(function) => EffectiveFunction::Classic(function),
            None => EffectiveFunction::Composed(modes),
        },
        None => match classic {
            Some(function) => EffectiveFunction::Classic(function),
            None => EffectiveFunction::Unknown,
        },
    }
}

pub fn status_text(classic: Option<MonitorFunction>, sub_modes: Option<SubModes>) -> Option<String> {
    match effective_function(classic, sub_modes) {
        EffectiveFunction::Classic(function) => Some(function.to_string()),
        EffectiveFunction::Composed(modes) => Some(modes.to_string()),
        EffectiveFunction::Unknown => None,
    }
}

pub fn select_option(classic: Option<MonitorFunction>, sub_modes: Option<SubModes>) -> Option<String> {
    match effective_function(classic, sub_modes) {
        EffectiveFunction::Classic(function) => Some(function.to_string()),
        EffectiveFunction::Composed(_) => Some(CUSTOM_LABEL.to_string()),
        EffectiveFunction::Unknown => None,
    }
}
